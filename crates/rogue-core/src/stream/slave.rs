//! Frame consumers.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{frame::FramePtr, pool::Pool};
use crate::error::Result;

/// Receiver of frames.
///
/// A slave also answers allocation requests from the master it is the
/// primary of. The default serves them from a private heap pool; zero-copy
/// sinks override it to hand out their own buffers.
pub trait Slave: Send + Sync {
    /// Take a frame. Errors are logged by the sending master.
    fn accept_frame(&self, frame: FramePtr) -> Result<()>;

    /// Allocate a frame with room for `size` payload bytes.
    fn accept_req(&self, size: usize, zero_copy_ok: bool) -> Result<FramePtr> {
        Pool::new().accept_req(size, zero_copy_ok, 0)
    }
}

/// Slave that counts and drops everything.
#[derive(Debug, Default)]
pub struct NullSlave {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl NullSlave {
    /// New slave with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames received.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Payload bytes received.
    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Slave for NullSlave {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let lock = frame.lock();
        let payload = lock.payload();
        debug!(payload, channel = lock.channel(), "dropping frame");
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload as u64, Ordering::Relaxed);
        Ok(())
    }
}
