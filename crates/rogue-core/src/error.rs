//! Error types for the stream and memory fabric.

use thiserror::Error;

use crate::memory::MemoryError;

/// Errors raised by fabric components.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation did not complete before its deadline
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Underlying allocator refused a request
    #[error("allocation of {0} bytes failed")]
    Allocation(usize),

    /// Access outside a frame or buffer
    #[error("boundary error: {what} {requested} exceeds {limit}")]
    Boundary {
        /// What was accessed
        what: &'static str,
        /// Requested extent
        requested: usize,
        /// Available extent
        limit: usize,
    },

    /// A size is invalid for the operation
    #[error("invalid size {0}")]
    Size(usize),

    /// An address or size violates alignment rules
    #[error("misaligned access at {0:#x}")]
    Alignment(u64),

    /// Peer violated a protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed wire data
    #[error("wire format: {0}")]
    Wire(#[from] rogue_proto::ProtocolError),

    /// Register transaction failed
    #[error("bus error: {0}")]
    Bus(#[from] MemoryError),

    /// Operation not supported by this component
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// I/O error from the OS
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation abandoned because its owner shut down
    #[error("cancelled")]
    Cancelled,

    /// Queue was stopped
    #[error("queue stopped")]
    Stopped,

    /// A buffer was returned to its pool twice
    #[error("buffer {0:#x} returned twice")]
    DoubleFree(u32),

    /// Connecting a hub would create a loop
    #[error("hub connection would create a cycle")]
    Cycle,
}

/// Convenience alias for fabric results.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a [`Error::Boundary`].
    pub fn boundary(what: &'static str, requested: usize, limit: usize) -> Self {
        Self::Boundary { what, requested, limit }
    }
}
