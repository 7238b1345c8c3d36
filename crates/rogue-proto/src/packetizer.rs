//! Packetizer segment format.
//!
//! A packetizer cuts an application frame into transport-sized segments.
//! Every segment carries an 8-byte header; version 2 adds an 8-byte tail
//! with the segment payload size, the end-of-frame marker and a CRC32
//! running over the payload of every segment of the frame so far.
//!
//! ```text
//! v1:  [ctrl][dest][seq:2][tdest][tid][rsvd:2] payload...
//! v2:  [ver|crc][dest][seq:2][tdest][tid][fuser][sof] payload... [size:3][last|luser][crc:4]
//! ```
//!
//! `seq` is the segment index within the frame, restarting at zero on the
//! segment that carries SOF.

use std::ops::Range;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32},
};

use crate::errors::{ProtocolError, Result, truncated};

/// Payload size of every segment but the last is a multiple of this.
pub const ALIGN_SIZE: usize = 8;

/// Version 2 CRC mode: no CRC carried.
pub const CRC_NONE: u8 = 0;
/// Version 2 CRC mode: CRC32 over segment payloads.
pub const CRC_DATA: u8 = 1;

const V1_SOF: u8 = 0x01;
const V1_LAST: u8 = 0x80;
const V2_SOF: u8 = 0x80;
const V2_LAST: u8 = 0x01;

/// Packetizer wire version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// Header only, last flag in the header
    V1,
    /// Header plus tail with size, SSI user fields and CRC
    V2,
}

impl Version {
    /// Header length in bytes.
    pub const fn header_size(self) -> usize {
        8
    }

    /// Tail length in bytes.
    pub const fn tail_size(self) -> usize {
        match self {
            Self::V1 => 0,
            Self::V2 => 8,
        }
    }

    /// Largest segment payload that fits a transport buffer of `max_buf`
    /// bytes, rounded down to [`ALIGN_SIZE`].
    pub const fn segment_size(self, max_buf: usize) -> usize {
        let overhead = self.header_size() + self.tail_size();
        if max_buf <= overhead {
            return 0;
        }
        (max_buf - overhead) / ALIGN_SIZE * ALIGN_SIZE
    }
}

/// Decoded per-segment metadata, independent of version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentMeta {
    /// Application destination (routing index)
    pub dest: u8,
    /// Segment index within the frame
    pub seq: u16,
    /// Frame channel carried end to end
    pub tdest: u8,
    /// Per-frame transaction counter
    pub tid: u8,
    /// First segment of a frame
    pub sof: bool,
    /// Last segment of a frame
    pub last: bool,
    /// SSI first-user byte (v2 only)
    pub first_user: u8,
    /// SSI last-user byte, low 7 bits carried (v2 only)
    pub last_user: u8,
    /// CRC mode (v2 only)
    pub crc_mode: u8,
    /// Running CRC through this segment (v2 only)
    pub crc: u32,
}

/// Version 1 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HeaderV1 {
    control: u8,
    dest: u8,
    seq: U16,
    tdest: u8,
    tid: u8,
    reserved: [u8; 2],
}

impl HeaderV1 {
    /// Wire size.
    pub const SIZE: usize = 8;

    /// Build a header from segment metadata.
    pub fn new(meta: &SegmentMeta) -> Self {
        let mut control = 0;
        if meta.sof {
            control |= V1_SOF;
        }
        if meta.last {
            control |= V1_LAST;
        }
        Self {
            control,
            dest: meta.dest,
            seq: U16::new(meta.seq),
            tdest: meta.tdest,
            tid: meta.tid,
            reserved: [0; 2],
        }
    }

    /// Metadata carried by this header.
    pub fn meta(&self) -> SegmentMeta {
        SegmentMeta {
            dest: self.dest,
            seq: self.seq.get(),
            tdest: self.tdest,
            tid: self.tid,
            sof: self.control & V1_SOF != 0,
            last: self.control & V1_LAST != 0,
            ..SegmentMeta::default()
        }
    }
}

/// Version 2 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HeaderV2 {
    version_crc: u8,
    dest: u8,
    seq: U16,
    tdest: u8,
    tid: u8,
    first_user: u8,
    control: u8,
}

impl HeaderV2 {
    /// Wire size.
    pub const SIZE: usize = 8;
    /// Version nibble value.
    pub const VERSION: u8 = 2;

    /// Build a header from segment metadata.
    pub fn new(meta: &SegmentMeta) -> Self {
        Self {
            version_crc: Self::VERSION | (meta.crc_mode << 4),
            dest: meta.dest,
            seq: U16::new(meta.seq),
            tdest: meta.tdest,
            tid: meta.tid,
            first_user: meta.first_user,
            control: if meta.sof { V2_SOF } else { 0 },
        }
    }

    /// Version nibble.
    pub fn version(&self) -> u8 {
        self.version_crc & 0x0F
    }

    /// CRC mode nibble.
    pub fn crc_mode(&self) -> u8 {
        self.version_crc >> 4
    }
}

/// Version 2 tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct TailV2 {
    size: [u8; 3],
    control: u8,
    crc: U32,
}

impl TailV2 {
    /// Wire size.
    pub const SIZE: usize = 8;
    /// Largest payload representable in the 24-bit size field.
    pub const MAX_SIZE: usize = 0x00FF_FFFF;

    /// Build a tail for a segment carrying `size` payload bytes.
    pub fn new(size: usize, meta: &SegmentMeta) -> Result<Self> {
        if size > Self::MAX_SIZE {
            return Err(ProtocolError::OutOfRange { field: "size", value: size as u64 });
        }
        let bytes = (size as u32).to_le_bytes();
        let mut control = (meta.last_user & 0x7F) << 1;
        if meta.last {
            control |= V2_LAST;
        }
        Ok(Self { size: [bytes[0], bytes[1], bytes[2]], control, crc: U32::new(meta.crc) })
    }

    /// Payload bytes carried by the segment.
    pub fn size(&self) -> usize {
        u32::from_le_bytes([self.size[0], self.size[1], self.size[2], 0]) as usize
    }

    /// End-of-frame marker.
    pub fn last(&self) -> bool {
        self.control & V2_LAST != 0
    }

    /// Low 7 bits of the SSI last-user byte.
    pub fn last_user(&self) -> u8 {
        self.control >> 1
    }

    /// Running CRC through this segment.
    pub fn crc(&self) -> u32 {
        self.crc.get()
    }
}

/// Write the header for `meta` into the front of `dst`.
pub fn encode_header(version: Version, meta: &SegmentMeta, dst: &mut [u8]) -> Result<()> {
    let need = version.header_size();
    let have = dst.len();
    let written = match version {
        Version::V1 => HeaderV1::new(meta).write_to_prefix(dst).is_ok(),
        Version::V2 => HeaderV2::new(meta).write_to_prefix(dst).is_ok(),
    };
    if written { Ok(()) } else { Err(truncated(need, have)) }
}

/// Write the v2 tail for a segment of `size` payload bytes into `dst`.
///
/// Version 1 has no tail; the call is a no-op.
pub fn encode_tail(version: Version, size: usize, meta: &SegmentMeta, dst: &mut [u8]) -> Result<()> {
    match version {
        Version::V1 => Ok(()),
        Version::V2 => {
            let tail = TailV2::new(size, meta)?;
            let have = dst.len();
            tail.write_to_prefix(dst).map_err(|_| truncated(TailV2::SIZE, have))
        },
    }
}

/// Parse a whole segment.
///
/// Returns the metadata and the byte range of the payload inside `segment`.
pub fn decode(version: Version, segment: &[u8]) -> Result<(SegmentMeta, Range<usize>)> {
    let overhead = version.header_size() + version.tail_size();
    if segment.len() < overhead {
        return Err(truncated(overhead, segment.len()));
    }
    let tail = &segment[segment.len() - version.tail_size()..];
    let (meta, size) = decode_parts(version, segment, tail, segment.len() - overhead)?;
    let start = version.header_size();
    Ok((meta, start..start + size))
}

/// Parse a segment whose header and tail were read out separately.
///
/// `room` is the number of bytes between header and tail. Returns the
/// metadata and the payload size, which on v2 may be shorter than `room`.
pub fn decode_parts(
    version: Version,
    header: &[u8],
    tail: &[u8],
    room: usize,
) -> Result<(SegmentMeta, usize)> {
    match version {
        Version::V1 => {
            let (header, _) = HeaderV1::read_from_prefix(header)
                .map_err(|_| truncated(HeaderV1::SIZE, header.len()))?;
            Ok((header.meta(), room))
        },
        Version::V2 => {
            let (header, _) = HeaderV2::read_from_prefix(header)
                .map_err(|_| truncated(HeaderV2::SIZE, header.len()))?;
            if header.version() != HeaderV2::VERSION {
                return Err(ProtocolError::UnsupportedVersion(header.version()));
            }

            let (tail, _) =
                TailV2::read_from_prefix(tail).map_err(|_| truncated(TailV2::SIZE, tail.len()))?;

            let size = tail.size();
            if size > room {
                return Err(ProtocolError::OutOfRange { field: "size", value: size as u64 });
            }

            let meta = SegmentMeta {
                dest: header.dest,
                seq: header.seq.get(),
                tdest: header.tdest,
                tid: header.tid,
                sof: header.control & V2_SOF != 0,
                last: tail.last(),
                first_user: header.first_user,
                last_user: tail.last_user(),
                crc_mode: header.crc_mode(),
                crc: tail.crc(),
            };
            Ok((meta, size))
        },
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn segment_size_is_aligned() {
        assert_eq!(Version::V1.segment_size(1500), 1488);
        assert_eq!(Version::V2.segment_size(1500), 1480);
        assert_eq!(Version::V2.segment_size(144), 128);
        assert_eq!(Version::V2.segment_size(16), 0);
    }

    #[test]
    fn v1_known_bytes() {
        let meta = SegmentMeta {
            dest: 3,
            seq: 0x0102,
            tdest: 7,
            tid: 9,
            sof: true,
            last: true,
            ..SegmentMeta::default()
        };
        let mut seg = [0u8; 8];
        encode_header(Version::V1, &meta, &mut seg).unwrap();
        assert_eq!(seg, hex!("81 03 02 01 07 09 00 00"));

        let (decoded, range) = decode(Version::V1, &seg).unwrap();
        assert_eq!(decoded.dest, 3);
        assert_eq!(decoded.seq, 0x0102);
        assert!(decoded.sof && decoded.last);
        assert!(range.is_empty());
    }

    #[test]
    fn v2_known_bytes() {
        let meta = SegmentMeta {
            dest: 1,
            seq: 0,
            tdest: 2,
            tid: 3,
            sof: true,
            last: true,
            first_user: 0x02,
            last_user: 0x01,
            crc_mode: CRC_DATA,
            crc: 0xAABB_CCDD,
        };
        let mut seg = [0u8; 20];
        encode_header(Version::V2, &meta, &mut seg).unwrap();
        seg[8..12].copy_from_slice(b"abcd");
        encode_tail(Version::V2, 4, &meta, &mut seg[12..]).unwrap();

        assert_eq!(seg[..8], hex!("12 01 00 00 02 03 02 80"));
        assert_eq!(seg[12..], hex!("04 00 00 03 DD CC BB AA"));

        let (decoded, range) = decode(Version::V2, &seg).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(&seg[range], b"abcd");
    }

    #[test]
    fn v2_rejects_bad_version_and_size() {
        let mut seg = [0u8; 16];
        seg[0] = 0x01;
        assert_eq!(decode(Version::V2, &seg), Err(ProtocolError::UnsupportedVersion(1)));

        seg[0] = 0x02;
        seg[8] = 1; // claims one payload byte but there is no room
        assert!(matches!(decode(Version::V2, &seg), Err(ProtocolError::OutOfRange { .. })));

        assert!(matches!(decode(Version::V2, &seg[..10]), Err(ProtocolError::Truncated { .. })));
    }

    proptest! {
        #[test]
        fn v2_header_fields_survive(
            dest in any::<u8>(),
            seq in any::<u16>(),
            tdest in any::<u8>(),
            tid in any::<u8>(),
            sof in any::<bool>(),
            last in any::<bool>(),
            first_user in any::<u8>(),
            last_user in 0u8..0x80,
            crc in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let meta = SegmentMeta {
                dest, seq, tdest, tid, sof, last, first_user, last_user,
                crc_mode: CRC_DATA, crc,
            };
            let mut seg = vec![0u8; 16 + payload.len()];
            encode_header(Version::V2, &meta, &mut seg).unwrap();
            seg[8..8 + payload.len()].copy_from_slice(&payload);
            let tail_at = 8 + payload.len();
            encode_tail(Version::V2, payload.len(), &meta, &mut seg[tail_at..]).unwrap();

            let (decoded, range) = decode(Version::V2, &seg).unwrap();
            prop_assert_eq!(decoded, meta);
            prop_assert_eq!(&seg[range], &payload[..]);
        }
    }
}
