//! File recorder record header.
//!
//! Each record in a data file is a little-endian 32-bit header followed by the
//! payload. The header carries the payload length in bits 27:0 and the channel
//! in bits 31:28. Channel 0 is the legacy raw-data channel: its length counts
//! 32-bit words and its payload is zero-padded to a word boundary. Every other
//! channel counts bytes and is written unpadded.

use crate::errors::{ProtocolError, Result, truncated};

/// Encoded header length.
pub const HEADER_SIZE: usize = 4;

/// Legacy raw-data channel.
pub const RAW_DATA_CHANNEL: u8 = 0;

/// Largest value of the size field.
pub const MAX_SIZE_FIELD: u32 = 0x0FFF_FFFF;

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Channel tag (0..=15)
    pub channel: u8,
    /// Raw size field: words for channel 0, bytes otherwise
    pub size: u32,
}

impl RecordHeader {
    /// Header for a payload of `len` bytes on `channel`.
    pub fn for_payload(channel: u8, len: usize) -> Result<Self> {
        if channel > 0x0F {
            return Err(ProtocolError::OutOfRange { field: "channel", value: u64::from(channel) });
        }
        let size = if channel == RAW_DATA_CHANNEL { len.div_ceil(4) } else { len };
        if size > MAX_SIZE_FIELD as usize {
            return Err(ProtocolError::OutOfRange { field: "size", value: size as u64 });
        }
        Ok(Self { channel, size: size as u32 })
    }

    /// Bytes that follow the header on disk.
    pub fn stored_len(&self) -> usize {
        if self.channel == RAW_DATA_CHANNEL {
            self.size as usize * 4
        } else {
            self.size as usize
        }
    }

    /// Encoded header word.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let word = (u32::from(self.channel) << 28) | (self.size & MAX_SIZE_FIELD);
        word.to_le_bytes()
    }

    /// Decode from the front of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let bytes: [u8; HEADER_SIZE] = src
            .get(..HEADER_SIZE)
            .and_then(|head| head.try_into().ok())
            .ok_or_else(|| truncated(HEADER_SIZE, src.len()))?;
        let word = u32::from_le_bytes(bytes);
        Ok(Self { channel: (word >> 28) as u8, size: word & MAX_SIZE_FIELD })
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn raw_data_counts_words() {
        let header = RecordHeader::for_payload(RAW_DATA_CHANNEL, 10).unwrap();
        assert_eq!(header.size, 3);
        assert_eq!(header.stored_len(), 12);
        assert_eq!(header.encode(), hex!("03 00 00 00"));
    }

    #[test]
    fn other_channels_count_bytes() {
        let header = RecordHeader::for_payload(5, 10).unwrap();
        assert_eq!(header.stored_len(), 10);
        assert_eq!(header.encode(), hex!("0A 00 00 50"));
        assert_eq!(RecordHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn rejects_wide_channel() {
        assert!(RecordHeader::for_payload(16, 1).is_err());
    }

    #[test]
    fn short_header() {
        assert_eq!(
            RecordHeader::decode(&[0, 1]),
            Err(ProtocolError::Truncated { need: 4, have: 2 })
        );
    }
}
