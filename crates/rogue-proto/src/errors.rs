//! Error types for wire format parsing.

use thiserror::Error;

/// Errors raised while decoding or encoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Slice shorter than the fixed layout requires
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },

    /// Version field does not match this codec
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// Header checksum mismatch
    #[error("bad checksum: header carries {expected:#06x}, computed {computed:#06x}")]
    BadChecksum {
        /// Checksum carried in the header
        expected: u16,
        /// Checksum computed over the received bytes
        computed: u16,
    },

    /// Header size byte disagrees with the flags
    #[error("invalid header size {0}")]
    InvalidHeaderSize(u8),

    /// A field value cannot be represented on the wire
    #[error("field {field} out of range: {value}")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u64,
    },

    /// Unknown opcode
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u32),
}

/// Convenience alias for wire-format results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

pub(crate) fn truncated(need: usize, have: usize) -> ProtocolError {
    ProtocolError::Truncated { need, have }
}
