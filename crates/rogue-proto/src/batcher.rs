//! Batcher version 1 layout.
//!
//! A batch packs several records into one carrier frame. The frame opens with
//! a super-header; each record is followed by a tail describing it, and record
//! data is padded to the tail width so every tail starts aligned:
//!
//! ```text
//! [super header][data0 + pad][tail0][data1 + pad][tail1] ... [dataN + pad][tailN]
//! ```
//!
//! Tails are read from the end of the frame backwards, so a receiver never
//! needs to know the record count in advance.

use std::ops::Range;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::little_endian::U16,
};

use crate::errors::{ProtocolError, Result, truncated};

/// Batcher protocol version carried in the super-header.
pub const VERSION: u8 = 1;

/// Largest record payload representable in a tail.
pub const MAX_RECORD: u32 = 0x00FF_FFFF;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct HeaderWire {
    ctrl: u8,
    reserved: u8,
    seq: U16,
    pad: [u8; 4],
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct TailWire {
    size: [u8; 3],
    dest: u8,
    first_user: u8,
    last_user: u8,
    reserved: [u8; 2],
}

/// Batch super-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuperHeader {
    /// Tail width code: header and tails are `8 << width` bytes
    pub width: u8,
    /// Batch sequence counter
    pub seq: u16,
}

impl SuperHeader {
    /// Header (and tail) length in bytes for this width.
    pub const fn size(&self) -> usize {
        8 << self.width
    }

    /// Encode into the front of `dst`, zero-filling the padding.
    pub fn encode(&self, dst: &mut [u8]) -> Result<usize> {
        if self.width > 3 {
            return Err(ProtocolError::OutOfRange { field: "width", value: u64::from(self.width) });
        }
        let size = self.size();
        let have = dst.len();
        if have < size {
            return Err(truncated(size, have));
        }
        let wire = HeaderWire {
            ctrl: VERSION | (self.width << 4),
            reserved: 0,
            seq: U16::new(self.seq),
            pad: [0; 4],
        };
        dst[..8].copy_from_slice(wire.as_bytes());
        dst[8..size].fill(0);
        Ok(size)
    }

    /// Decode from the front of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let (wire, _) = HeaderWire::read_from_prefix(src).map_err(|_| truncated(8, src.len()))?;
        let version = wire.ctrl & 0x0F;
        if version != VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let header = Self { width: wire.ctrl >> 4, seq: wire.seq.get() };
        if header.width > 3 {
            return Err(ProtocolError::InvalidHeaderSize(wire.ctrl));
        }
        if src.len() < header.size() {
            return Err(truncated(header.size(), src.len()));
        }
        Ok(header)
    }
}

/// Per-record tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordTail {
    /// Record payload size in bytes, before padding
    pub size: u32,
    /// Destination (becomes the channel of the split frame)
    pub dest: u8,
    /// SSI first-user byte
    pub first_user: u8,
    /// SSI last-user byte
    pub last_user: u8,
}

impl RecordTail {
    /// Encode into the front of `dst`; `tail_size` bytes are written.
    pub fn encode(&self, tail_size: usize, dst: &mut [u8]) -> Result<usize> {
        if self.size > MAX_RECORD {
            return Err(ProtocolError::OutOfRange { field: "size", value: u64::from(self.size) });
        }
        let have = dst.len();
        if have < tail_size || tail_size < 8 {
            return Err(truncated(tail_size.max(8), have));
        }
        let size = self.size.to_le_bytes();
        let wire = TailWire {
            size: [size[0], size[1], size[2]],
            dest: self.dest,
            first_user: self.first_user,
            last_user: self.last_user,
            reserved: [0; 2],
        };
        dst[..8].copy_from_slice(wire.as_bytes());
        dst[8..tail_size].fill(0);
        Ok(tail_size)
    }

    /// Decode from the front of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let (wire, _) = TailWire::read_from_prefix(src).map_err(|_| truncated(8, src.len()))?;
        Ok(Self {
            size: u32::from_le_bytes([wire.size[0], wire.size[1], wire.size[2], 0]),
            dest: wire.dest,
            first_user: wire.first_user,
            last_user: wire.last_user,
        })
    }
}

/// Round `size` up to a multiple of `align` (a power of two).
pub const fn padded(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// One record located inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Decoded tail
    pub tail: RecordTail,
    /// Payload byte range within the batch (unpadded)
    pub data: Range<usize>,
    /// Byte offset of the tail within the batch
    pub tail_offset: usize,
}

/// Parse a complete batch, returning the header and records in frame order.
pub fn parse(batch: &[u8]) -> Result<(SuperHeader, Vec<Record>)> {
    let header = SuperHeader::decode(batch)?;
    let width = header.size();

    if batch.len() % width != 0 {
        return Err(ProtocolError::OutOfRange { field: "batch length", value: batch.len() as u64 });
    }

    let mut records = Vec::new();
    let mut end = batch.len();
    while end > width {
        let tail_offset = end - width;
        let tail = RecordTail::decode(&batch[tail_offset..])?;
        let span = padded(tail.size as usize, width);
        if span > tail_offset - width {
            return Err(ProtocolError::OutOfRange { field: "record size", value: u64::from(tail.size) });
        }
        let start = tail_offset - span;
        records.push(Record { tail, data: start..start + tail.size as usize, tail_offset });
        end = start;
    }
    records.reverse();
    Ok((header, records))
}

/// Rewrite a tail-based batch into header-based form in place.
///
/// Tail 0 replaces the super-header, every later tail moves into the slot of
/// the tail before it, and the last tail slot is dropped:
///
/// ```text
/// [hdr][d0][t0][d1][t1]  ->  [t0][d0][t1][d1]
/// ```
///
/// Returns the new length of the batch.
pub fn invert(batch: &mut [u8]) -> Result<usize> {
    let (header, records) = parse(batch)?;
    let width = header.size();

    let mut slot = 0;
    for record in &records {
        batch.copy_within(record.tail_offset..record.tail_offset + width, slot);
        slot = record.tail_offset;
    }
    Ok(batch.len() - width)
}
