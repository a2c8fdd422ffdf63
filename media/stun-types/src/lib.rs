//! STUN ([RFC8489]) and TURN ([RFC5766]) message encoding and decoding.
//!
//! [RFC8489]: https://datatracker.ietf.org/doc/html/rfc8489
//! [RFC5766]: https://datatracker.ietf.org/doc/html/rfc5766

use byteorder::ReadBytesExt;
use header::{MessageHead, STUN_HEADER_LENGTH};
use std::fmt;
use std::io::{self, Cursor};
use std::num::TryFromIntError;
use std::str::Utf8Error;

pub mod attributes;
mod channel_data;
mod header;
mod message;

pub use channel_data::ChannelData;
pub use header::{Class, Method};
pub use message::{AttrSpan, Message, MessageBuilder};

type NE = byteorder::NetworkEndian;

const COOKIE: u32 = 0x2112A442;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input data, {0}")]
    InvalidData(&'static str),
    #[error("failed to convert integer")]
    TryFromInt(#[from] TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::InvalidData("buffer seems incomplete"),
            _ => Self::InvalidData("failed to read from buffer"),
        }
    }
}

fn padding_u16(n: u16) -> u16 {
    (4 - n % 4) % 4
}

fn padding_usize(n: usize) -> usize {
    (4 - n % 4) % 4
}

/// 96 bit STUN transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    pub fn new(v: [u8; 12]) -> Self {
        Self(v)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }

        Ok(())
    }
}

/// Return value of [`is_stun_message`]
#[derive(Debug, PartialEq, Eq)]
pub enum IsStunMessageInfo {
    /// Message is shorter than 20 bytes (STUN message header length),
    /// making it impossible to check.
    TooShort,

    /// Buffer does not contain a STUN message.
    No,

    /// Buffer contains a STUN message.
    /// Variant contains the remaining amount of bytes.
    Yes { remaining: usize },

    /// Buffer contains a STUN message, but its incomplete.
    /// Variant contains the needed amount of bytes message.
    YesIncomplete { needed: usize },
}

/// Inspect the given input to find out if it contains a STUN message.
///
/// Does not perform any kind of searching, to detect the
/// STUN message it must begin at the start of the input.
pub fn is_stun_message(i: &[u8]) -> IsStunMessageInfo {
    if i.len() < STUN_HEADER_LENGTH {
        return IsStunMessageInfo::TooShort;
    }

    let mut cursor = Cursor::new(i);

    let (Ok(head), Ok(cookie)) = (cursor.read_u32::<NE>(), cursor.read_u32::<NE>()) else {
        return IsStunMessageInfo::TooShort;
    };

    let head = MessageHead(head);

    if head.z() != 0 || cookie != COOKIE {
        return IsStunMessageInfo::No;
    }

    let expected_msg_len = usize::from(head.len()) + STUN_HEADER_LENGTH;

    if i.len() < expected_msg_len {
        IsStunMessageInfo::YesIncomplete {
            needed: expected_msg_len - i.len(),
        }
    } else {
        IsStunMessageInfo::Yes {
            remaining: i.len() - expected_msg_len,
        }
    }
}

/// Kind of a datagram received on a socket which carries STUN, TURN and application data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Stun,
    ChannelData,
    Other,
}

/// Demultiplex a received datagram using the first byte ([RFC7983](https://datatracker.ietf.org/doc/html/rfc7983#section-7))
pub fn classify(i: &[u8]) -> PacketKind {
    match i.first() {
        Some(0..=3) if matches!(is_stun_message(i), IsStunMessageInfo::Yes { .. }) => {
            PacketKind::Stun
        }
        Some(64..=127) if i.len() >= channel_data::CHANNEL_DATA_HEADER_LENGTH => {
            PacketKind::ChannelData
        }
        _ => PacketKind::Other,
    }
}
