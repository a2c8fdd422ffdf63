use crate::attributes::{Attribute, Fingerprint, MessageIntegrity};
use crate::header::{Class, MessageHead, Method, STUN_HEADER_LENGTH, message_type};
use crate::{COOKIE, Error, NE, TransactionId, padding_u16, padding_usize};
use byteorder::ReadBytesExt;
use bytes::{Buf, BufMut};
use std::io::{Cursor, Read};

#[derive(Debug, Clone, Copy)]
pub struct AttrSpan {
    /// Index where the attribute's value begins
    pub begin: usize,

    /// Index of end of the attribute's value
    pub end: usize,

    /// End of the attribute's value including padding
    pub padding_end: usize,

    /// Attribute type id
    pub typ: u16,
}

impl AttrSpan {
    pub fn get_value<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        &buf[self.begin..self.end]
    }
}

/// Parsed STUN message
///
/// Attributes are decoded lazily using [`Message::attribute`].
pub struct Message {
    buffer: Vec<u8>,

    head: MessageHead,
    id: u128,

    class: Class,
    method: Method,
    transaction_id: TransactionId,

    attributes: Vec<AttrSpan>,
}

impl Message {
    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Cookie and transaction id as a single number, used as XOR key for IPv6 addresses
    pub(crate) fn id(&self) -> u128 {
        self.id
    }

    pub fn parse(buffer: impl Into<Vec<u8>>) -> Result<Message, Error> {
        let mut cursor = Cursor::new(buffer.into());

        let head = MessageHead(cursor.read_u32::<NE>()?);

        if head.z() != 0 {
            return Err(Error::InvalidData("not a stun message"));
        }

        let id = cursor.read_u128::<NE>()?;

        let mut id_cursor = Cursor::new(id.to_be_bytes());
        let cookie = id_cursor.read_u32::<NE>()?;
        let mut transaction_id = [0u8; 12];
        id_cursor.read_exact(&mut transaction_id)?;

        if cookie != COOKIE {
            return Err(Error::InvalidData("not a stun message"));
        }

        let msg_end = STUN_HEADER_LENGTH + usize::from(head.len());

        if msg_end > cursor.get_ref().len() {
            return Err(Error::InvalidData("buffer seems incomplete"));
        }

        // Drop anything trailing the message
        cursor.get_mut().truncate(msg_end);

        let class = Class::from_typ(head.typ());
        let method = Method::from_typ(head.typ())?;

        let mut attributes = vec![];

        while cursor.has_remaining() {
            let typ = cursor.read_u16::<NE>()?;
            let len = usize::from(cursor.read_u16::<NE>()?);

            let begin = usize::try_from(cursor.position())?;
            let end = begin + len;
            let padding_end = end + padding_usize(len);

            if end > cursor.get_ref().len() {
                return Err(Error::InvalidData(
                    "Invalid attribute length in STUN message",
                ));
            }

            attributes.push(AttrSpan {
                begin,
                end,
                padding_end,
                typ,
            });

            cursor.set_position(u64::try_from(padding_end.min(cursor.get_ref().len()))?);
        }

        Ok(Message {
            buffer: cursor.into_inner(),
            head,
            id,
            class,
            method,
            transaction_id: TransactionId(transaction_id),
            attributes,
        })
    }

    /// Returns if the message contains an attribute of the given type, regardless of its position
    pub fn has_attribute(&self, typ: u16) -> bool {
        self.attributes.iter().any(|attr| attr.typ == typ)
    }

    /// Try to read an attribute from the message
    pub fn attribute<'a, A>(&'a mut self) -> Option<Result<A, Error>>
    where
        A: Attribute<'a, Context = ()> + 'a,
    {
        self.attribute_with(())
    }

    /// Try to read an attribute from the message with a required context (like a key to verify the integrity of the message)
    pub fn attribute_with<'a, A>(&'a mut self, ctx: A::Context) -> Option<Result<A, Error>>
    where
        A: Attribute<'a> + 'a,
    {
        let mut after_integrity = false;

        for attr in self.attributes.iter().copied() {
            // Only FINGERPRINT may follow MESSAGE-INTEGRITY
            if after_integrity && attr.typ != Fingerprint::TYPE {
                return None;
            }

            if attr.typ == A::TYPE {
                return Some(A::decode(ctx, self, attr));
            }

            if attr.typ == MessageIntegrity::TYPE {
                after_integrity = true;
            }
        }

        None
    }

    fn set_msg_len(&mut self, len: u16) {
        self.head.set_len(len);
        self.buffer[..4].copy_from_slice(&self.head.0.to_be_bytes());
    }

    /// Access the message with the given length set.
    ///
    /// E.g. Integrity of the message is computed with the length set to the end of previous attribute
    pub fn with_msg_len<F, R>(&mut self, len: u16, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        let old_len = self.head.len();
        self.set_msg_len(len);

        let result = f(self);

        self.set_msg_len(old_len);

        result
    }

    /// Return the raw message
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

/// Builder for a STUN message
pub struct MessageBuilder {
    head: MessageHead,
    transaction_id: TransactionId,

    buffer: Vec<u8>,

    /// First error encountered while encoding an attribute, returned by `finish`
    error: Option<Error>,
}

impl MessageBuilder {
    /// Create a new message builder.
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        let mut head = MessageHead(0);
        head.set_typ(message_type(class, method));

        let mut buffer = Vec::with_capacity(128);
        buffer.put_u32(head.0);
        buffer.put_u32(COOKIE);
        buffer.put_slice(&transaction_id.0);

        Self {
            head,
            transaction_id,
            buffer,
            error: None,
        }
    }

    /// Set the length of the message
    pub fn set_len(&mut self, len: u16) {
        self.head.set_len(len);
        self.buffer[..4].copy_from_slice(&self.head.0.to_be_bytes());
    }

    /// Serialize the attribute into the builder
    pub fn add_attr<'a, A>(&mut self, attr: A)
    where
        A: Attribute<'a, Context = ()>,
    {
        self.add_attr_with(attr, ())
    }

    /// Serialize the attribute into the builder with a given context (e.g. a key to calculate the integrity)
    pub fn add_attr_with<'a, A>(&mut self, attr: A, ctx: A::Context)
    where
        A: Attribute<'a>,
    {
        if self.error.is_some() {
            return;
        }

        let enc_len = match attr.encode_len() {
            Ok(enc_len) => enc_len,
            Err(e) => {
                self.error = Some(e);
                return;
            }
        };

        self.buffer.put_u16(A::TYPE);
        self.buffer.put_u16(enc_len);

        attr.encode(ctx, self);

        self.buffer
            .extend(std::iter::repeat_n(0, usize::from(padding_u16(enc_len))));
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub(crate) fn id(&self) -> u128 {
        let mut id = [0u8; 16];

        id[..4].copy_from_slice(&COOKIE.to_be_bytes());
        id[4..].copy_from_slice(&self.transaction_id.0);

        u128::from_be_bytes(id)
    }

    pub fn finish(mut self) -> Result<Vec<u8>, Error> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let len = u16::try_from(self.buffer.len() - STUN_HEADER_LENGTH)?;
        self.set_len(len);

        Ok(self.buffer)
    }

    pub fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}
