//! SRP (Streaming Register Protocol) frame formats.
//!
//! SRP carries one memory transaction per stream frame. A request is a
//! header (plus write data); the response echoes the header, carries the
//! data (read result or echoed write data) and ends with a 32-bit status
//! tail. All words are little-endian.
//!
//! ```text
//! v0 request:  [tid][op:2|addr[31:2]:30] ([count-1] for reads) (data...)
//! v0 response: [tid][op|addr] data... [status]
//! v3 request:  [ver|op|timeout][tid][addr lo][addr hi][size-1] (data...)
//! v3 response: same 20-byte header, data..., [status]
//! ```

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::little_endian::U32,
};

use crate::errors::{ProtocolError, Result, truncated};

/// Length of the status tail.
pub const TAIL_SIZE: usize = 4;

/// Status tail bit: the remote bus timed out.
pub const TAIL_TIMEOUT: u32 = 1 << 8;
/// Status tail mask: remote AXI response code.
pub const TAIL_BUS_RESP: u32 = 0xFF;

/// Request opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Non-posted read
    Read,
    /// Non-posted write, response expected
    Write,
    /// Posted write, no response
    Posted,
}

/// Classified tail status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStatus {
    /// Transaction succeeded
    Ok,
    /// Remote bus timeout
    Timeout,
    /// Any other non-zero status
    Fail(u32),
}

impl TailStatus {
    /// Classify a raw tail word.
    pub fn from_word(word: u32) -> Self {
        match word {
            0 => Self::Ok,
            w if w & TAIL_TIMEOUT != 0 => Self::Timeout,
            w => Self::Fail(w),
        }
    }
}

/// Read the status tail at the end of a response.
pub fn decode_tail(frame: &[u8]) -> Result<u32> {
    let (_, tail) =
        U32::read_from_suffix(frame).map_err(|_| truncated(TAIL_SIZE, frame.len()))?;
    Ok(tail.get())
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct V3Wire {
    header0: U32,
    tid: U32,
    addr_lo: U32,
    addr_hi: U32,
    req_size: U32,
}

/// SRP version 3 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrpV3Header {
    /// Request type
    pub opcode: Opcode,
    /// Transaction id
    pub tid: u32,
    /// Byte address
    pub address: u64,
    /// Transfer size in bytes
    pub size: u32,
    /// Remote timeout hint
    pub timeout: u8,
}

impl SrpV3Header {
    /// Wire size.
    pub const SIZE: usize = 20;
    /// Version byte.
    pub const VERSION: u8 = 0x03;

    /// Encode into a fixed array.
    pub fn encode(&self) -> Result<[u8; Self::SIZE]> {
        if self.size == 0 {
            return Err(ProtocolError::OutOfRange { field: "size", value: 0 });
        }
        let op: u32 = match self.opcode {
            Opcode::Read => 0,
            Opcode::Write => 1,
            Opcode::Posted => 3,
        };
        let wire = V3Wire {
            header0: U32::new(
                u32::from(Self::VERSION) | (op << 8) | (u32::from(self.timeout) << 24),
            ),
            tid: U32::new(self.tid),
            addr_lo: U32::new(self.address as u32),
            addr_hi: U32::new((self.address >> 32) as u32),
            req_size: U32::new(self.size - 1),
        };
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(wire.as_bytes());
        Ok(out)
    }

    /// Decode from the front of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let (wire, _) =
            V3Wire::read_from_prefix(src).map_err(|_| truncated(Self::SIZE, src.len()))?;
        let header0 = wire.header0.get();
        let version = (header0 & 0xFF) as u8;
        if version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let opcode = match (header0 >> 8) & 0x3 {
            0 => Opcode::Read,
            1 => Opcode::Write,
            3 => Opcode::Posted,
            other => return Err(ProtocolError::InvalidOpcode(other)),
        };
        Ok(Self {
            opcode,
            tid: wire.tid.get(),
            address: u64::from(wire.addr_lo.get()) | (u64::from(wire.addr_hi.get()) << 32),
            size: wire.req_size.get().wrapping_add(1),
            timeout: (header0 >> 24) as u8,
        })
    }

    /// Expected response length for this request, or `None` for posted writes.
    pub fn response_size(&self) -> Option<usize> {
        match self.opcode {
            Opcode::Posted => None,
            Opcode::Read | Opcode::Write => Some(Self::SIZE + self.size as usize + TAIL_SIZE),
        }
    }

    /// Request length including write data.
    pub fn request_size(&self) -> usize {
        match self.opcode {
            Opcode::Read => Self::SIZE,
            Opcode::Write | Opcode::Posted => Self::SIZE + self.size as usize,
        }
    }
}

/// SRP version 0 header.
///
/// Version 0 addresses 32-bit words, so addresses must be 4-byte aligned and
/// fit in 32 bits, and sizes must be whole words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrpV0Header {
    /// Request type (posted writes are sent as writes)
    pub opcode: Opcode,
    /// Transaction id
    pub tid: u32,
    /// Byte address
    pub address: u64,
    /// Transfer size in bytes
    pub size: u32,
}

impl SrpV0Header {
    /// Header size of a write request and of every response.
    pub const WRITE_SIZE: usize = 8;
    /// Header size of a read request.
    pub const READ_SIZE: usize = 12;
    /// Highest addressable byte + 1.
    pub const ADDRESS_LIMIT: u64 = 1 << 32;

    /// Encoded request header length.
    pub fn header_size(&self) -> usize {
        match self.opcode {
            Opcode::Read => Self::READ_SIZE,
            Opcode::Write | Opcode::Posted => Self::WRITE_SIZE,
        }
    }

    /// Encode the request header into the front of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<usize> {
        if self.address % 4 != 0 || self.address >= Self::ADDRESS_LIMIT {
            return Err(ProtocolError::OutOfRange { field: "address", value: self.address });
        }
        if self.size == 0 || self.size % 4 != 0 {
            return Err(ProtocolError::OutOfRange { field: "size", value: u64::from(self.size) });
        }
        let len = self.header_size();
        if dst.len() < len {
            return Err(truncated(len, dst.len()));
        }

        let op: u32 = match self.opcode {
            Opcode::Read => 0,
            Opcode::Write | Opcode::Posted => 1,
        };
        let word1 = (op << 30) | ((self.address >> 2) as u32 & 0x3FFF_FFFF);
        dst[0..4].copy_from_slice(&self.tid.to_le_bytes());
        dst[4..8].copy_from_slice(&word1.to_le_bytes());
        if self.opcode == Opcode::Read {
            dst[8..12].copy_from_slice(&(self.size / 4 - 1).to_le_bytes());
        }
        Ok(len)
    }

    /// Decode the 8-byte response header.
    ///
    /// Returns `(tid, opcode, address)`; the size is implied by the frame
    /// length.
    pub fn decode_response(src: &[u8]) -> Result<(u32, Opcode, u64)> {
        if src.len() < Self::WRITE_SIZE {
            return Err(truncated(Self::WRITE_SIZE, src.len()));
        }
        let tid = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let word1 = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        let opcode = match word1 >> 30 {
            0 => Opcode::Read,
            1 => Opcode::Write,
            other => return Err(ProtocolError::InvalidOpcode(other)),
        };
        Ok((tid, opcode, u64::from(word1 & 0x3FFF_FFFF) << 2))
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn v3_write_header_bytes() {
        let header = SrpV3Header {
            opcode: Opcode::Write,
            tid: 7,
            address: 0x1_0000_0020,
            size: 4,
            timeout: 0x0A,
        };
        let bytes = header.encode().unwrap();
        assert_eq!(
            bytes,
            hex!("03 01 00 0A 07 00 00 00 20 00 00 00 01 00 00 00 03 00 00 00")
        );
        assert_eq!(SrpV3Header::decode(&bytes).unwrap(), header);
        assert_eq!(header.request_size(), 24);
        assert_eq!(header.response_size(), Some(28));
    }

    #[test]
    fn v3_posted_has_no_response() {
        let header =
            SrpV3Header { opcode: Opcode::Posted, tid: 1, address: 0, size: 8, timeout: 0 };
        let bytes = header.encode().unwrap();
        assert_eq!(SrpV3Header::decode(&bytes).unwrap().opcode, Opcode::Posted);
        assert_eq!(header.response_size(), None);
    }

    #[test]
    fn v3_rejects_other_versions() {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x02;
        assert_eq!(SrpV3Header::decode(&bytes), Err(ProtocolError::UnsupportedVersion(2)));
    }

    #[test]
    fn v0_read_header() {
        let header = SrpV0Header { opcode: Opcode::Read, tid: 0x55, address: 0x100, size: 16 };
        let mut buf = [0u8; 12];
        assert_eq!(header.encode(&mut buf).unwrap(), 12);
        assert_eq!(buf, hex!("55 00 00 00 40 00 00 00 03 00 00 00"));

        let (tid, op, addr) = SrpV0Header::decode_response(&buf).unwrap();
        assert_eq!((tid, op, addr), (0x55, Opcode::Read, 0x100));
    }

    #[test]
    fn v0_write_header_sets_opcode() {
        let header = SrpV0Header { opcode: Opcode::Write, tid: 1, address: 0xFFFF_FFFC, size: 4 };
        let mut buf = [0u8; 8];
        header.encode(&mut buf).unwrap();
        let (_, op, addr) = SrpV0Header::decode_response(&buf).unwrap();
        assert_eq!(op, Opcode::Write);
        assert_eq!(addr, 0xFFFF_FFFC);

        let high = SrpV0Header { address: 0x1_0000_0000, ..header };
        assert!(high.encode(&mut buf).is_err());
    }

    #[test]
    fn v0_rejects_unaligned() {
        let header = SrpV0Header { opcode: Opcode::Write, tid: 1, address: 0x2, size: 4 };
        let mut buf = [0u8; 8];
        assert!(header.encode(&mut buf).is_err());

        let header = SrpV0Header { opcode: Opcode::Write, tid: 1, address: 0, size: 6 };
        assert!(header.encode(&mut buf).is_err());
    }

    #[test]
    fn tail_classification() {
        assert_eq!(TailStatus::from_word(0), TailStatus::Ok);
        assert_eq!(TailStatus::from_word(TAIL_TIMEOUT), TailStatus::Timeout);
        assert_eq!(TailStatus::from_word(0x2), TailStatus::Fail(0x2));

        let frame = hex!("AA BB 00 01 00 00");
        assert_eq!(decode_tail(&frame).unwrap(), 0x0000_0100);
    }
}
