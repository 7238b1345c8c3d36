//! RSSI segment header.
//!
//! RSSI (Reliable SSI) is a reliable, sequenced segment protocol derived from
//! RUDP. Every segment starts with a header; SYN segments carry a 24-byte
//! header with the connection parameters, all others an 8-byte header.
//! Multi-byte fields use network byte order.
//!
//! ```text
//! data/ack/nul/rst:  [flags][size=8][seq][ack][frag][spare][chk:2]
//! syn:               [flags][size=24][seq][ack][ver|chk][max_out][max_seg:2]
//!                    [retran:2][cum_ack:2][null:2][max_retran][max_cum_ack]
//!                    [unit][spare][conn_id:4][chk:2]
//! ```

use bitflags::bitflags;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U16, U32},
};

use crate::errors::{ProtocolError, Result, truncated};

bitflags! {
    /// Segment control flags (first header byte).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RssiFlags: u8 {
        /// Connection request / response
        const SYN = 0x80;
        /// Acknowledge field is valid
        const ACK = 0x40;
        /// Extended acknowledge (never generated)
        const EACK = 0x20;
        /// Reset the connection
        const RST = 0x10;
        /// Keepalive
        const NUL = 0x08;
        /// Sender cannot accept more data
        const BUSY = 0x01;
    }
}

/// Protocol version advertised in SYN.
pub const VERSION: u8 = 1;

const FRAG_MORE: u8 = 0x01;
const CHK_ENABLED: u8 = 0x04;

/// Connection parameters exchanged in SYN segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynParams {
    /// Maximum segments in flight
    pub max_outstanding: u8,
    /// Maximum segment size in bytes, header included
    pub max_segment: u16,
    /// Retransmission timeout in timeout units
    pub retran_tout: u16,
    /// Cumulative ACK timeout in timeout units
    pub cum_ack_tout: u16,
    /// Null keepalive timeout in timeout units
    pub null_tout: u16,
    /// Maximum retransmissions of one segment
    pub max_retran: u8,
    /// Maximum segments received before an ACK is forced
    pub max_cum_ack: u8,
    /// Timeout unit as a power of ten of seconds (3 = milliseconds)
    pub timeout_unit: u8,
    /// Connection identifier
    pub conn_id: u32,
}

impl SynParams {
    /// Pairwise minimum of two parameter sets.
    ///
    /// The local connection id is kept.
    #[must_use]
    pub fn negotiate(&self, peer: &Self) -> Self {
        Self {
            max_outstanding: self.max_outstanding.min(peer.max_outstanding),
            max_segment: self.max_segment.min(peer.max_segment),
            retran_tout: self.retran_tout.min(peer.retran_tout),
            cum_ack_tout: self.cum_ack_tout.min(peer.cum_ack_tout),
            null_tout: self.null_tout.min(peer.null_tout),
            max_retran: self.max_retran.min(peer.max_retran),
            max_cum_ack: self.max_cum_ack.min(peer.max_cum_ack),
            timeout_unit: self.timeout_unit.min(peer.timeout_unit),
            conn_id: self.conn_id,
        }
    }
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ShortWire {
    flags: u8,
    size: u8,
    seq: u8,
    ack: u8,
    frag: u8,
    spare: u8,
    checksum: U16,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SynWire {
    flags: u8,
    size: u8,
    seq: u8,
    ack: u8,
    version: u8,
    max_outstanding: u8,
    max_segment: U16,
    retran_tout: U16,
    cum_ack_tout: U16,
    null_tout: U16,
    max_retran: u8,
    max_cum_ack: u8,
    timeout_unit: u8,
    spare: u8,
    conn_id: U32,
    checksum: U16,
}

/// Decoded RSSI header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiHeader {
    /// Control flags
    pub flags: RssiFlags,
    /// Sequence number of this segment
    pub seq: u8,
    /// Last in-order sequence number received by the sender
    pub ack: u8,
    /// More fragments of the same application frame follow
    pub more: bool,
    /// Connection parameters, present on SYN segments
    pub syn: Option<SynParams>,
}

impl RssiHeader {
    /// Size of a data, ACK, NULL or RST header.
    pub const SIZE: usize = 8;
    /// Size of a SYN header.
    pub const SYN_SIZE: usize = 24;

    /// Header with the given flags and no SYN block.
    pub fn new(flags: RssiFlags, seq: u8, ack: u8) -> Self {
        Self { flags, seq, ack, more: false, syn: None }
    }

    /// SYN header carrying `params`.
    pub fn syn(flags: RssiFlags, seq: u8, ack: u8, params: SynParams) -> Self {
        Self { flags: flags | RssiFlags::SYN, seq, ack, more: false, syn: Some(params) }
    }

    /// Encoded length.
    pub fn size(&self) -> usize {
        if self.syn.is_some() { Self::SYN_SIZE } else { Self::SIZE }
    }

    /// Write the header, checksum included, to the front of `dst`.
    ///
    /// Returns the number of bytes written.
    pub fn encode(&self, dst: &mut [u8]) -> Result<usize> {
        let size = self.size();
        let have = dst.len();
        if have < size {
            return Err(truncated(size, have));
        }

        let written = match &self.syn {
            None => ShortWire {
                flags: self.flags.bits(),
                size: Self::SIZE as u8,
                seq: self.seq,
                ack: self.ack,
                frag: if self.more { FRAG_MORE } else { 0 },
                spare: 0,
                checksum: U16::new(0),
            }
            .write_to_prefix(dst)
            .is_ok(),
            Some(p) => SynWire {
                flags: self.flags.bits(),
                size: Self::SYN_SIZE as u8,
                seq: self.seq,
                ack: self.ack,
                version: (VERSION << 4) | CHK_ENABLED,
                max_outstanding: p.max_outstanding,
                max_segment: U16::new(p.max_segment),
                retran_tout: U16::new(p.retran_tout),
                cum_ack_tout: U16::new(p.cum_ack_tout),
                null_tout: U16::new(p.null_tout),
                max_retran: p.max_retran,
                max_cum_ack: p.max_cum_ack,
                timeout_unit: p.timeout_unit,
                spare: 0,
                conn_id: U32::new(p.conn_id),
                checksum: U16::new(0),
            }
            .write_to_prefix(dst)
            .is_ok(),
        };
        if !written {
            return Err(truncated(size, have));
        }

        let sum = checksum(&dst[..size]);
        dst[size - 2..size].copy_from_slice(&sum.to_be_bytes());
        Ok(size)
    }

    /// Parse and verify a header at the front of `src`.
    ///
    /// Returns the header and its encoded length.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        if src.len() < Self::SIZE {
            return Err(truncated(Self::SIZE, src.len()));
        }

        let flags = RssiFlags::from_bits_truncate(src[0]);
        let size = src[1] as usize;
        let expected = if flags.contains(RssiFlags::SYN) { Self::SYN_SIZE } else { Self::SIZE };
        if size != expected {
            return Err(ProtocolError::InvalidHeaderSize(src[1]));
        }
        if src.len() < size {
            return Err(truncated(size, src.len()));
        }

        let carried = u16::from_be_bytes([src[size - 2], src[size - 1]]);
        let computed = checksum(&src[..size]);
        if carried != computed {
            return Err(ProtocolError::BadChecksum { expected: carried, computed });
        }

        if flags.contains(RssiFlags::SYN) {
            let (wire, _) =
                SynWire::read_from_prefix(src).map_err(|_| truncated(Self::SYN_SIZE, src.len()))?;
            let version = wire.version >> 4;
            if version != VERSION {
                return Err(ProtocolError::UnsupportedVersion(version));
            }
            let params = SynParams {
                max_outstanding: wire.max_outstanding,
                max_segment: wire.max_segment.get(),
                retran_tout: wire.retran_tout.get(),
                cum_ack_tout: wire.cum_ack_tout.get(),
                null_tout: wire.null_tout.get(),
                max_retran: wire.max_retran,
                max_cum_ack: wire.max_cum_ack,
                timeout_unit: wire.timeout_unit,
                conn_id: wire.conn_id.get(),
            };
            Ok((Self::syn(flags, wire.seq, wire.ack, params), size))
        } else {
            let (wire, _) =
                ShortWire::read_from_prefix(src).map_err(|_| truncated(Self::SIZE, src.len()))?;
            let header = Self {
                flags,
                seq: wire.seq,
                ack: wire.ack,
                more: wire.frag & FRAG_MORE != 0,
                syn: None,
            };
            Ok((header, size))
        }
    }
}

/// One's-complement checksum over a header, skipping the trailing checksum
/// field.
pub fn checksum(header: &[u8]) -> u16 {
    let body = header.len().saturating_sub(2);
    let mut sum: u32 = 0;
    for pair in header[..body].chunks(2) {
        let word = match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
