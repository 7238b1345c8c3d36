//! Memory fabric: register transactions from masters to slaves.
//!
//! A [`Master`] owns every transaction it issues. Slaves see them through
//! [`TransactionPtr`] handles and keep only weak references in their
//! per-slave map, which is how an asynchronous slave (a register bridge
//! waiting on a response frame) finds the transaction again without keeping
//! it alive after the master gave up on it.
//!
//! [`Hub`]s sit between the two, OR'ing their offset into the address of
//! every transaction that passes through and answering constraint queries by
//! asking downstream.

mod emulator;
mod error;
mod hub;
mod master;
mod slave;
mod transaction;

pub use emulator::Emulator;
pub use error::MemoryError;
pub use hub::Hub;
pub use master::{DEFAULT_TIMEOUT, Master};
pub use slave::{Slave, SlaveCore};
pub use transaction::{Transaction, TransactionLock, TransactionPtr, TransactionType};
