use super::{ATTRIBUTE_HEADER_LEN, Attribute};
use crate::Error;
use crate::header::STUN_HEADER_LENGTH;
use crate::message::{AttrSpan, Message, MessageBuilder};
use hmac::digest::Update;
use hmac::{Mac, SimpleHmac};
use sha1::Sha1;

const SHA1_OUTPUT_LEN: u16 = 20;

/// Derive the long-term credential key `MD5(username ":" realm ":" password)`
pub fn long_term_password_md5(username: &str, realm: &str, password: &str) -> Vec<u8> {
    md5::compute(format!("{username}:{realm}:{password}").as_bytes()).to_vec()
}

/// HMAC-SHA1 key used to compute or verify MESSAGE-INTEGRITY
#[derive(Clone)]
pub struct MessageIntegrityKey(SimpleHmac<Sha1>);

impl MessageIntegrityKey {
    /// Key from raw bytes, e.g. the ICE password for short-term credentials
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(SimpleHmac::new_from_slice(key.as_ref()).expect("any key length is valid"))
    }

    /// Key for long-term credentials as used by TURN
    pub fn long_term(username: &str, realm: &str, password: &str) -> Self {
        Self::new(long_term_password_md5(username, realm, password))
    }
}

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.5)
pub struct MessageIntegrity;

impl Attribute<'_> for MessageIntegrity {
    type Context = MessageIntegrityKey;
    const TYPE: u16 = 0x0008;

    fn decode(ctx: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let mut hmac = ctx.0;

        // The HMAC input is the message up to the attribute preceding MESSAGE-INTEGRITY,
        // with the header length pointing to the end of MESSAGE-INTEGRITY
        let len = u16::try_from(attr.padding_end - STUN_HEADER_LENGTH)?;

        msg.with_msg_len(len, |msg| {
            let received_digest = attr.get_value(msg.buffer());
            let message = &msg.buffer()[..attr.begin - ATTRIBUTE_HEADER_LEN];

            Update::update(&mut hmac, message);
            let calculated_digest = hmac.finalize().into_bytes();

            if calculated_digest.as_slice() != received_digest {
                return Err(Error::InvalidData("failed to verify message integrity"));
            }

            Ok(Self)
        })
    }

    fn encode(&self, ctx: Self::Context, builder: &mut MessageBuilder) {
        let mut hmac = ctx.0;

        // Type and length of this attribute are already in the buffer
        let len = builder.buffer().len() + usize::from(SHA1_OUTPUT_LEN) - STUN_HEADER_LENGTH;

        // Length overflow is reported by `MessageBuilder::finish`
        builder.set_len(u16::try_from(len).unwrap_or(u16::MAX));

        let data = builder.buffer();
        Update::update(&mut hmac, &data[..data.len() - ATTRIBUTE_HEADER_LEN]);
        let digest = hmac.finalize().into_bytes();

        builder.buffer().extend_from_slice(&digest);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(SHA1_OUTPUT_LEN)
    }
}
