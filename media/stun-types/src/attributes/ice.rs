//! ICE attributes [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-16.1)

use super::{Attribute, decode_u32, decode_u64};
use crate::Error;
use crate::message::{AttrSpan, Message, MessageBuilder};
use bytes::BufMut;

/// Priority a peer-reflexive candidate learned from this request would get
pub struct Priority(pub u32);

impl Attribute<'_> for Priority {
    type Context = ();
    const TYPE: u16 = 0x0024;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        decode_u32(
            attr.get_value(msg.buffer()),
            "priority value must be 4 bytes",
        )
        .map(Self)
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u32(self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

flag_attribute!(
    /// Set by the controlling agent to nominate the pair the request is sent on
    UseCandidate,
    0x0025
);

/// Tie breaker of an agent in the controlled role
pub struct IceControlled(pub u64);

impl Attribute<'_> for IceControlled {
    type Context = ();
    const TYPE: u16 = 0x8029;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        decode_u64(
            attr.get_value(msg.buffer()),
            "ice-controlled value must be 8 bytes",
        )
        .map(Self)
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u64(self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(8)
    }
}

/// Tie breaker of an agent in the controlling role
pub struct IceControlling(pub u64);

impl Attribute<'_> for IceControlling {
    type Context = ();
    const TYPE: u16 = 0x802A;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        decode_u64(
            attr.get_value(msg.buffer()),
            "ice-controlling value must be 8 bytes",
        )
        .map(Self)
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u64(self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(8)
    }
}
