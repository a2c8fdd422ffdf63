use super::Attribute;
use crate::message::{AttrSpan, Message, MessageBuilder};
use crate::{COOKIE, Error, NE};
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

const XOR16: u16 = (COOKIE >> 16) as u16;

const FAMILY_IPV4: u8 = 1;
const FAMILY_IPV6: u8 = 2;

/// XOR keys applied to port, IPv4 and IPv6 address. All zero for plain address attributes.
#[derive(Clone, Copy)]
struct XorKey {
    port: u16,
    v4: u32,
    v6: u128,
}

impl XorKey {
    const NONE: Self = Self {
        port: 0,
        v4: 0,
        v6: 0,
    };

    fn for_id(id: u128) -> Self {
        Self {
            port: XOR16,
            v4: COOKIE,
            v6: id,
        }
    }
}

fn decode_addr(mut buf: &[u8], key: XorKey) -> Result<SocketAddr, Error> {
    if buf.read_u8()? != 0 {
        return Err(Error::InvalidData("first byte must be zero"));
    }

    let family = buf.read_u8()?;
    let port = buf.read_u16::<NE>()? ^ key.port;

    match family {
        FAMILY_IPV4 => {
            let ip = buf.read_u32::<NE>()? ^ key.v4;
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
        FAMILY_IPV6 => {
            let ip = buf.read_u128::<NE>()? ^ key.v6;
            Ok(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0)))
        }
        _ => Err(Error::InvalidData("invalid address family")),
    }
}

fn encode_addr(addr: SocketAddr, buf: &mut Vec<u8>, key: XorKey) {
    buf.put_u8(0);

    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(addr.port() ^ key.port);
            buf.put_u32(addr.ip().to_bits() ^ key.v4);
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(addr.port() ^ key.port);
            buf.put_u128(addr.ip().to_bits() ^ key.v6);
        }
    }
}

fn addr_len(addr: &SocketAddr) -> u16 {
    match addr {
        SocketAddr::V4(_) => 8,
        SocketAddr::V6(_) => 20,
    }
}

macro_rules! address_attribute {
    ($(#[$meta:meta])* $name:ident, $typ:literal, xor: $xor:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub SocketAddr);

        impl Attribute<'_> for $name {
            type Context = ();
            const TYPE: u16 = $typ;

            fn decode(_: Self::Context, msg: &mut Message, attr: AttrSpan) -> Result<Self, Error> {
                let key = if $xor { XorKey::for_id(msg.id()) } else { XorKey::NONE };

                decode_addr(attr.get_value(msg.buffer()), key).map(Self)
            }

            fn encode(&self, _: Self::Context, builder: &mut MessageBuilder) {
                let key = if $xor { XorKey::for_id(builder.id()) } else { XorKey::NONE };

                encode_addr(self.0, builder.buffer(), key);
            }

            fn encode_len(&self) -> Result<u16, Error> {
                Ok(addr_len(&self.0))
            }
        }
    };
}

address_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.1)
    MappedAddress, 0x0001, xor: false
);

address_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.2)
    XorMappedAddress, 0x0020, xor: true
);

address_attribute!(
    /// [RFC8489](https://datatracker.ietf.org/doc/html/rfc8489#section-14.15)
    AlternateServer, 0x8023, xor: false
);

address_attribute!(
    /// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.3)
    XorPeerAddress, 0x0012, xor: true
);

address_attribute!(
    /// [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.5)
    XorRelayedAddress, 0x0016, xor: true
);
