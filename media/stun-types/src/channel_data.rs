use crate::{Error, NE};
use byteorder::ReadBytesExt;
use bytes::BufMut;

pub(crate) const CHANNEL_DATA_HEADER_LENGTH: usize = 4;

/// TURN ChannelData message [RFC5766](https://datatracker.ietf.org/doc/html/rfc5766#section-11.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelData<'a> {
    pub channel: u16,
    pub data: &'a [u8],
}

impl<'a> ChannelData<'a> {
    pub fn new(channel: u16, data: &'a [u8]) -> Self {
        Self { channel, data }
    }

    pub fn parse(mut i: &'a [u8]) -> Result<Self, Error> {
        let channel = i.read_u16::<NE>()?;
        let len = usize::from(i.read_u16::<NE>()?);

        if !(0x4000..=0x7FFF).contains(&channel) {
            return Err(Error::InvalidData("channel number out of range"));
        }

        // Over UDP the message may carry padding after the data
        let data = i
            .get(..len)
            .ok_or(Error::InvalidData("channel data length exceeds datagram"))?;

        Ok(Self { channel, data })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHANNEL_DATA_HEADER_LENGTH + self.data.len());

        buf.put_u16(self.channel);
        // UDP datagrams never exceed u16::MAX
        buf.put_u16(u16::try_from(self.data.len()).unwrap_or(u16::MAX));
        buf.extend_from_slice(self.data);

        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_channel_data() {
        let bytes = ChannelData::new(0x4002, b"abc").to_vec();
        assert_eq!(bytes, [0x40, 0x02, 0x00, 0x03, b'a', b'b', b'c']);

        let mut padded = bytes.clone();
        padded.push(0);

        let parsed = ChannelData::parse(&padded).unwrap();
        assert_eq!(parsed.channel, 0x4002);
        assert_eq!(parsed.data, b"abc");
    }

    #[test]
    fn reject_invalid_channel_data() {
        assert!(ChannelData::parse(&[0x40, 0x00, 0x00, 0x08, 1, 2]).is_err());
        assert!(ChannelData::parse(&[0x30, 0x00, 0x00, 0x00]).is_err());
        assert!(ChannelData::parse(&[0x40]).is_err());
    }
}
