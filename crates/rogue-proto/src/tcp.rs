//! TCP bridge framing.
//!
//! A bridged frame travels as `[len:4][flags:2][error:1][channel:1][payload]`
//! where `len` counts the envelope plus payload. All fields little-endian.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::little_endian::U16,
};

use crate::errors::{ProtocolError, Result, truncated};

/// Length prefix size.
pub const PREFIX_SIZE: usize = 4;

/// Upper bound accepted for a single bridged frame.
pub const MAX_FRAME: u32 = 64 * 1024 * 1024;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct EnvelopeWire {
    flags: U16,
    error: u8,
    channel: u8,
}

/// Frame metadata carried in front of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Envelope {
    /// Frame flags
    pub flags: u16,
    /// Frame error byte
    pub error: u8,
    /// Frame channel
    pub channel: u8,
}

impl Envelope {
    /// Encoded length.
    pub const SIZE: usize = 4;

    /// Encode the length prefix and envelope for a payload of `payload_len`.
    pub fn encode_with_prefix(&self, payload_len: usize) -> Result<[u8; PREFIX_SIZE + Self::SIZE]> {
        let total = payload_len + Self::SIZE;
        if total > MAX_FRAME as usize {
            return Err(ProtocolError::OutOfRange { field: "length", value: total as u64 });
        }
        let wire = EnvelopeWire { flags: U16::new(self.flags), error: self.error, channel: self.channel };
        let mut out = [0u8; PREFIX_SIZE + Self::SIZE];
        out[..PREFIX_SIZE].copy_from_slice(&(total as u32).to_le_bytes());
        out[PREFIX_SIZE..].copy_from_slice(wire.as_bytes());
        Ok(out)
    }

    /// Decode the envelope at the front of a length-delimited body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let (wire, _) =
            EnvelopeWire::read_from_prefix(body).map_err(|_| truncated(Self::SIZE, body.len()))?;
        Ok(Self { flags: wire.flags.get(), error: wire.error, channel: wire.channel })
    }
}

/// Validate a received length prefix, returning the body length.
pub fn decode_prefix(prefix: [u8; PREFIX_SIZE]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix);
    if (len as usize) < Envelope::SIZE || len > MAX_FRAME {
        return Err(ProtocolError::OutOfRange { field: "length", value: u64::from(len) });
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn envelope_bytes() {
        let env = Envelope { flags: 0x0201, error: 3, channel: 4 };
        let bytes = env.encode_with_prefix(6).unwrap();
        assert_eq!(bytes, hex!("0A 00 00 00 01 02 03 04"));
        assert_eq!(decode_prefix([0x0A, 0, 0, 0]).unwrap(), 10);
        assert_eq!(Envelope::decode(&bytes[4..]).unwrap(), env);
    }

    #[test]
    fn rejects_short_prefix() {
        assert!(decode_prefix([2, 0, 0, 0]).is_err());
        assert!(decode_prefix(u32::MAX.to_le_bytes()).is_err());
    }
}
