use thiserror::Error;

/// Bus-visible transaction error.
///
/// Each kind has a stable numeric code; a master latches the codes of the
/// errors it observes into a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MemoryError {
    /// No completion before the deadline
    #[error("transaction timed out")]
    Timeout,
    /// Read-back did not match the written data
    #[error("verify mismatch")]
    Verify,
    /// Address outside the slave's range or misaligned
    #[error("address error")]
    Address,
    /// Size not supported by the slave
    #[error("size error")]
    Size,
    /// Remote bus timed out
    #[error("remote bus timeout")]
    BusTimeout,
    /// Remote bus reported a failure
    #[error("remote bus failure")]
    BusFail,
    /// Malformed or mismatched response
    #[error("protocol error")]
    Protocol,
    /// Slave cannot execute this transaction
    #[error("unsupported transaction")]
    Unsupported,
}

impl MemoryError {
    /// Every kind, in code order.
    pub const ALL: [Self; 8] = [
        Self::Timeout,
        Self::Verify,
        Self::Address,
        Self::Size,
        Self::BusTimeout,
        Self::BusFail,
        Self::Protocol,
        Self::Unsupported,
    ];

    /// Stable numeric code.
    pub const fn code(self) -> u32 {
        match self {
            Self::Timeout => 0x01,
            Self::Verify => 0x02,
            Self::Address => 0x04,
            Self::Size => 0x08,
            Self::BusTimeout => 0x10,
            Self::BusFail => 0x20,
            Self::Protocol => 0x40,
            Self::Unsupported => 0x80,
        }
    }

    /// Kind for a numeric code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    /// Kinds present in a latched bitset.
    pub fn from_bits(bits: u32) -> Vec<Self> {
        Self::ALL.into_iter().filter(|e| bits & e.code() != 0).collect()
    }
}
