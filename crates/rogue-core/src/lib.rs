//! Rogue stream and memory fabric.
//!
//! Two independent graphs share this crate:
//!
//! - The **stream** fabric moves [`stream::Frame`]s from Masters to Slaves.
//!   Frames are chains of pool-owned [`stream::Buffer`]s; buffers return to
//!   their pool when dropped, so a zero-copy source (a DMA driver) gets its
//!   memory back without any explicit release call.
//! - The **memory** fabric carries register [`memory::Transaction`]s from a
//!   [`memory::Master`] through address-translating [`memory::Hub`]s to a
//!   [`memory::Slave`] that executes them, possibly asynchronously.
//!
//! Both fabrics run on plain OS threads. Components that hand work between
//! threads do so through [`BoundedQueue`], which gives back-pressure and a
//! busy signal. There is no async runtime.
//!
//! # Components
//!
//! - [`queue`]: blocking bounded FIFO
//! - [`stream`]: buffers, pools, frames, masters, slaves, transforms
//! - [`memory`]: transactions, masters, slaves, hubs, RAM emulator
//! - [`error`]: error taxonomy

pub mod error;
pub mod memory;
pub mod queue;
pub mod stream;

pub use error::{Error, Result};
pub use queue::BoundedQueue;
