//! TURN attributes [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14)

use super::{Attribute, BytesAttribute, decode_u32};
use crate::message::{AttrSpan, Message, MessageBuilder};
use crate::{Error, NE};
use byteorder::ReadBytesExt;
use bytes::BufMut;

/// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.1)
pub struct ChannelNumber(pub u16);

impl ChannelNumber {
    pub const MIN: u16 = 0x4000;
    pub const MAX: u16 = 0x7FFF;
}

impl Attribute<'_> for ChannelNumber {
    type Context = ();
    const TYPE: u16 = 0x000C;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let mut value = attr.get_value(msg.buffer());

        if value.len() != 4 {
            return Err(Error::InvalidData("channel number value must be 4 bytes"));
        }

        Ok(Self(value.read_u16::<NE>()?))
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u16(self.0);
        // RFFU
        builder.buffer().put_u16(0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

/// Lifetime in seconds, [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.2)
pub struct Lifetime(pub u32);

impl Attribute<'_> for Lifetime {
    type Context = ();
    const TYPE: u16 = 0x000D;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        decode_u32(
            attr.get_value(msg.buffer()),
            "lifetime value must be 4 bytes",
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

/// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.4)
pub type Data<'s> = BytesAttribute<'s, 0x0013>;

/// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.6)
pub struct EvenPort(pub bool);

impl Attribute<'_> for EvenPort {
    type Context = ();
    const TYPE: u16 = 0x0018;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let mut value = attr.get_value(msg.buffer());

        Ok(Self(value.read_u8()? & 0x80 != 0))
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u8(if self.0 { 0x80 } else { 0 });
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(1)
    }
}

/// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.7)
pub struct RequestedTransport {
    /// <https://www.iana.org/assignments/protocol-numbers/protocol-numbers.xhtml>
    pub protocol_number: u8,
}

impl RequestedTransport {
    pub const UDP: Self = Self {
        protocol_number: 17,
    };
}

impl Attribute<'_> for RequestedTransport {
    type Context = ();
    const TYPE: u16 = 0x0019;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        let mut value = attr.get_value(msg.buffer());

        Ok(Self {
            protocol_number: value.read_u8()?,
        })
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().put_u8(self.protocol_number);
        // RFFU
        builder.buffer().put_u8(0);
        builder.buffer().put_u16(0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(4)
    }
}

flag_attribute!(
    /// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.8)
    DontFragment,
    0x001A
);

/// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.9)
pub struct ReservationToken(pub [u8; 8]);

impl Attribute<'_> for ReservationToken {
    type Context = ();
    const TYPE: u16 = 0x0022;

    fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
        attr.get_value(msg.buffer())
            .try_into()
            .map(Self)
            .map_err(|_| Error::InvalidData("reservation token must be 8 bytes"))
    }

    fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
        builder.buffer().extend_from_slice(&self.0);
    }

    fn encode_len(&self) -> Result<u16, Error> {
        Ok(8)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::attributes::{XorPeerAddress, XorRelayedAddress};
    use crate::{Class, Method, TransactionId};
    use std::net::SocketAddr;

    #[test]
    fn allocate_request() {
        let mut builder =
            MessageBuilder::new(Class::Request, Method::Allocate, TransactionId::random());
        builder.add_attr(RequestedTransport::UDP);
        builder.add_attr(Lifetime(600));
        builder.add_attr(DontFragment);
        builder.add_attr(EvenPort(true));

        let bytes = builder.finish().unwrap();
        let mut msg = Message::parse(bytes).unwrap();

        assert_eq!(
            msg.attribute::<RequestedTransport>()
                .unwrap()
                .unwrap()
                .protocol_number,
            17
        );
        assert_eq!(msg.attribute::<Lifetime>().unwrap().unwrap().0, 600);
        assert!(msg.attribute::<DontFragment>().unwrap().is_ok());
        assert!(msg.attribute::<EvenPort>().unwrap().unwrap().0);
    }

    #[test]
    fn send_indication() {
        let peer: SocketAddr = "198.51.100.7:4000".parse().unwrap();
        let relayed: SocketAddr = "203.0.113.2:50000".parse().unwrap();

        let mut builder =
            MessageBuilder::new(Class::Indication, Method::Send, TransactionId::random());
        builder.add_attr(XorPeerAddress(peer));
        builder.add_attr(XorRelayedAddress(relayed));
        builder.add_attr(ChannelNumber(0x4001));
        builder.add_attr(Data::new(b"payload"));

        let mut msg = Message::parse(builder.finish().unwrap()).unwrap();

        assert_eq!(msg.attribute::<XorPeerAddress>().unwrap().unwrap().0, peer);
        assert_eq!(
            msg.attribute::<XorRelayedAddress>().unwrap().unwrap().0,
            relayed
        );
        assert_eq!(msg.attribute::<ChannelNumber>().unwrap().unwrap().0, 0x4001);
        assert_eq!(msg.attribute::<Data>().unwrap().unwrap().0, b"payload");
    }
}
