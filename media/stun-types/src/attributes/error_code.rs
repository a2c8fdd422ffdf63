use super::Attribute;
use crate::message::{AttrSpan, Message, MessageBuilder};
use crate::{Error, NE};
use bitfield::bitfield;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::str::from_utf8;

bitfield! {
    struct ErrorCodeHead(u32);
    number, set_number: 7, 0;
    class, set_class: 11, 8;
}

/// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.8)
pub struct ErrorCode<'s> {
    pub number: u16,
    pub reason: &'s str,
}

impl ErrorCode<'_> {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const ALLOCATION_MISMATCH: u16 = 437;
    pub const STALE_NONCE: u16 = 438;
    pub const ALLOCATION_QUOTA_REACHED: u16 = 486;
    pub const ROLE_CONFLICT: u16 = 487;
    pub const INSUFFICIENT_CAPACITY: u16 = 508;
}

impl<'s> Attribute<'s> for ErrorCode<'s> {
    type Context = ();
    const TYPE: u16 = 0x0009;

    fn decode(_: Self::Context, msg: &'s mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let mut value = attr.get_value(msg.buffer());

        if value.len() < 4 {
            return Err(Error::InvalidData("error code must be at least 4 bytes"));
        }

        let head = ErrorCodeHead(value.read_u32::<NE>()?);

        Ok(Self {
            number: u16::try_from(head.class() * 100 + head.number())?,
            reason: from_utf8(value)?,
        })
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        let mut head = ErrorCodeHead(0);

        head.set_class(u32::from(self.number / 100));
        head.set_number(u32::from(self.number % 100));

        builder.buffer().put_u32(head.0);
        builder.buffer().extend_from_slice(self.reason.as_bytes());
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(u16::try_from(4 + self.reason.len())?)
    }
}
