//! Stream fabric: frames flowing from masters to slaves.
//!
//! A [`Master`] delivers each frame to its slaves in insertion order. The
//! first slave is the primary: it also serves the master's frame
//! allocations, which lets a zero-copy sink hand out its own memory to the
//! producer feeding it. Nodes that both receive and emit frames (every
//! transform and protocol engine) implement [`Slave`] and expose their
//! outbound side through [`AsMaster`].

use std::sync::Arc;

pub mod buffer;
pub mod fifo;
pub mod filter;
pub mod frame;
pub mod iterator;
pub mod master;
pub mod pool;
pub mod rate_drop;
pub mod slave;

pub use buffer::{Buffer, BufferSource, Region};
pub use fifo::{Fifo, FifoConfig};
pub use filter::Filter;
pub use frame::{Frame, FrameLock, FramePtr};
pub use iterator::{FrameIterator, FrameIteratorMut};
pub use master::{AsMaster, Master};
pub use pool::Pool;
pub use rate_drop::RateDrop;
pub use slave::{NullSlave, Slave};

/// Attach `slave` to `master`. The first slave attached becomes the primary.
pub fn connect(master: &(impl AsMaster + ?Sized), slave: Arc<dyn Slave>) {
    master.master().add_slave(slave);
}

/// Connect two duplex nodes to each other.
///
/// Each node holds the other, so the pair lives until one side's slaves are
/// cleared with [`Master::clear_slaves`].
pub fn connect_bidir<A, B>(a: &Arc<A>, b: &Arc<B>)
where
    A: AsMaster + Slave + 'static,
    B: AsMaster + Slave + 'static,
{
    connect(a.as_ref(), b.clone());
    connect(b.as_ref(), a.clone());
}
