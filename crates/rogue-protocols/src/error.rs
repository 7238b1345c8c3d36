//! Engine errors that do not map onto the fabric taxonomy.

use thiserror::Error;

/// Errors raised by the RSSI controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RssiError {
    /// Data submitted while the connection is not open
    #[error("connection not open")]
    NotOpen,

    /// Segment could not be encoded
    #[error("wire format: {0}")]
    Wire(#[from] rogue_proto::ProtocolError),
}

impl From<RssiError> for rogue_core::Error {
    fn from(e: RssiError) -> Self {
        match e {
            RssiError::NotOpen => Self::Cancelled,
            RssiError::Wire(e) => Self::Wire(e),
        }
    }
}
