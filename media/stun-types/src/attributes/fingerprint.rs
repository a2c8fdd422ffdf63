use super::{ATTRIBUTE_HEADER_LEN, Attribute, decode_u32};
use crate::Error;
use crate::header::STUN_HEADER_LENGTH;
use crate::message::{AttrSpan, Message, MessageBuilder};
use bytes::BufMut;
use crc::{CRC_32_ISO_HDLC, Crc};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const FINGERPRINT_XOR: u32 = 0x5354554e;

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.7)
pub struct Fingerprint;

impl Attribute<'_> for Fingerprint {
    type Context = ();
    const TYPE: u16 = 0x8028;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let len = u16::try_from(attr.padding_end - STUN_HEADER_LENGTH)?;

        msg.with_msg_len(len, |msg| {
            let received = decode_u32(
                attr.get_value(msg.buffer()),
                "fingerprint value must be 4 bytes",
            )?;

            let data = &msg.buffer()[..attr.begin - ATTRIBUTE_HEADER_LEN];

            if CRC32.checksum(data) ^ FINGERPRINT_XOR != received {
                return Err(Error::InvalidData("failed to verify message fingerprint"));
            }

            Ok(Self)
        })
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        // Type and length of this attribute are already in the buffer
        let len = builder.buffer().len() + 4 - STUN_HEADER_LENGTH;
        builder.set_len(u16::try_from(len).unwrap_or(u16::MAX));

        let data = builder.buffer();
        let crc = CRC32.checksum(&data[..data.len() - ATTRIBUTE_HEADER_LEN]) ^ FINGERPRINT_XOR;

        builder.buffer().put_u32(crc);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}
