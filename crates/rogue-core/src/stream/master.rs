//! Frame producers.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::warn;

use super::{frame::FramePtr, pool::Pool, slave::Slave};
use crate::error::Result;

/// Sender side of a stream node.
///
/// Frames go to every attached slave in attachment order. A failing slave
/// is logged and skipped; the remaining slaves still receive the frame.
#[derive(Default)]
pub struct Master {
    slaves: Mutex<Vec<Arc<dyn Slave>>>,
    pool: Pool,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl fmt::Debug for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("slaves", &self.slaves.lock().len())
            .field("frames", &self.frame_count())
            .finish_non_exhaustive()
    }
}

impl Master {
    /// Master with no slaves.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `slave` as the primary, replacing any existing primary.
    pub fn set_slave(&self, slave: Arc<dyn Slave>) {
        let mut slaves = self.slaves.lock();
        if slaves.is_empty() {
            slaves.push(slave);
        } else {
            slaves[0] = slave;
        }
    }

    /// Append a slave. The first one added becomes the primary.
    pub fn add_slave(&self, slave: Arc<dyn Slave>) {
        self.slaves.lock().push(slave);
    }

    /// Detach every slave.
    pub fn clear_slaves(&self) {
        self.slaves.lock().clear();
    }

    /// Number of attached slaves.
    pub fn slave_count(&self) -> usize {
        self.slaves.lock().len()
    }

    /// Allocate a frame from the primary slave, or from a local heap pool
    /// when no slave is attached.
    pub fn req_frame(&self, size: usize, zero_copy_ok: bool) -> Result<FramePtr> {
        let primary = self.slaves.lock().first().cloned();
        match primary {
            Some(slave) => slave.accept_req(size, zero_copy_ok),
            None => self.pool.accept_req(size, zero_copy_ok, 0),
        }
    }

    /// Deliver `frame` to every slave.
    pub fn send_frame(&self, frame: FramePtr) {
        let slaves = self.slaves.lock().clone();
        let payload = frame.lock().payload();
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload as u64, Ordering::Relaxed);

        for (index, slave) in slaves.iter().enumerate() {
            if let Err(e) = slave.accept_frame(Arc::clone(&frame)) {
                warn!(slave = index, payload, error = %e, "slave failed to accept frame");
            }
        }
    }

    /// Frames sent.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Payload bytes sent.
    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// A node with an outbound stream side.
pub trait AsMaster {
    /// The node's sender.
    fn master(&self) -> &Master;
}

impl AsMaster for Master {
    fn master(&self) -> &Master {
        self
    }
}
