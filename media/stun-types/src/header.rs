use crate::Error;
use bitfield::bitfield;

pub(crate) const STUN_HEADER_LENGTH: usize = 20;

bitfield! {
    /// First 32 bits of a STUN message header
    pub(crate) struct MessageHead(u32);

    u8;
    pub(crate) z, _: 31, 30;

    u16;
    pub(crate) typ, set_typ: 29, 16;

    #[allow(clippy::len_without_is_empty)]
    pub(crate) len, set_len: 15, 0;
}

/// STUN class
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    const MASK: u16 = 0x110;

    fn bits(self) -> u16 {
        match self {
            Class::Request => 0x000,
            Class::Indication => 0x010,
            Class::Success => 0x100,
            Class::Error => 0x110,
        }
    }

    pub(crate) fn from_typ(typ: u16) -> Self {
        match typ & Self::MASK {
            0x000 => Class::Request,
            0x010 => Class::Indication,
            0x100 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// STUN/TURN Methods
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Method {
    // === STUN ===
    Binding,

    // === TURN ===
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
}

impl Method {
    const MASK: u16 = 0x3EEF;

    fn bits(self) -> u16 {
        match self {
            Method::Binding => 0x1,
            Method::Allocate => 0x3,
            Method::Refresh => 0x4,
            Method::Send => 0x6,
            Method::Data => 0x7,
            Method::CreatePermission => 0x8,
            Method::ChannelBind => 0x9,
        }
    }

    pub(crate) fn from_typ(typ: u16) -> Result<Self, Error> {
        match typ & Self::MASK {
            0x1 => Ok(Method::Binding),
            0x3 => Ok(Method::Allocate),
            0x4 => Ok(Method::Refresh),
            0x6 => Ok(Method::Send),
            0x7 => Ok(Method::Data),
            0x8 => Ok(Method::CreatePermission),
            0x9 => Ok(Method::ChannelBind),
            _ => Err(Error::InvalidData("unknown method")),
        }
    }
}

/// Combine class and method into the 14 bit message type
pub(crate) fn message_type(class: Class, method: Method) -> u16 {
    (class.bits() & Class::MASK) | (method.bits() & Method::MASK)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_type_bits() {
        assert_eq!(message_type(Class::Request, Method::Binding), 0x0001);
        assert_eq!(message_type(Class::Success, Method::Binding), 0x0101);
        assert_eq!(message_type(Class::Error, Method::Allocate), 0x0113);
        assert_eq!(message_type(Class::Indication, Method::Send), 0x0016);
        assert_eq!(message_type(Class::Indication, Method::Data), 0x0017);

        let typ = message_type(Class::Error, Method::ChannelBind);
        assert_eq!(Class::from_typ(typ), Class::Error);
        assert_eq!(Method::from_typ(typ).unwrap(), Method::ChannelBind);
    }
}
