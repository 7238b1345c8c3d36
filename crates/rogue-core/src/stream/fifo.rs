//! Depth-limited hand-off between threads.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    frame::FramePtr,
    master::{AsMaster, Master},
    pool::Pool,
    slave::Slave,
};
use crate::{error::Result, queue::BoundedQueue};

/// Fifo configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoConfig {
    /// Queue depth above which incoming frames are dropped (0 = unlimited)
    pub max_depth: usize,
    /// Copy at most this many payload bytes per frame (0 = whole frame)
    pub trim_size: usize,
    /// Queue the original frame instead of a copy
    pub no_copy: bool,
}

struct Shared {
    master: Master,
    queue: BoundedQueue<FramePtr>,
    pool: Pool,
    config: FifoConfig,
    dropped: AtomicU64,
}

/// Queues frames and forwards them from a worker thread.
///
/// Incoming frames are copied (and optionally trimmed) into buffers from the
/// fifo's own pool, so the sender's buffers are released immediately. When
/// the queue is busy the frame is dropped and counted.
pub struct Fifo {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Fifo {
    /// Start a fifo and its worker thread.
    pub fn new(config: FifoConfig) -> Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            master: Master::new(),
            queue: BoundedQueue::new(0, config.max_depth),
            pool: Pool::new(),
            config,
            dropped: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("rogue-fifo".into()).spawn(move || {
                while let Ok(frame) = shared.queue.pop() {
                    shared.master.send_frame(frame);
                }
                debug!("fifo worker exiting");
            })?
        };

        Ok(Arc::new(Self { shared, worker: Mutex::new(Some(worker)) }))
    }

    /// Frames currently queued.
    pub fn size(&self) -> usize {
        self.shared.queue.len()
    }

    /// Frames dropped because the queue was busy.
    pub fn drop_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Reset the drop counter.
    pub fn clear_count(&self) {
        self.shared.dropped.store(0, Ordering::Relaxed);
    }

    /// Stop the worker and discard queued frames.
    pub fn stop(&self) {
        self.shared.queue.stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AsMaster for Fifo {
    fn master(&self) -> &Master {
        &self.shared.master
    }
}

impl Slave for Fifo {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let shared = &self.shared;
        if shared.queue.busy() {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(depth = shared.queue.len(), "fifo busy, dropping frame");
            return Ok(());
        }

        if shared.config.no_copy {
            return shared.queue.push(frame);
        }

        let copy = {
            let src = frame.lock();
            let payload = src.payload();
            let size = match shared.config.trim_size {
                0 => payload,
                trim => payload.min(trim),
            };
            let copy = shared.pool.accept_req(size, false, 0)?;
            let mut dst = copy.lock();
            dst.copy_payload_from(&src, 0, size)?;
            dst.copy_meta(&src);
            drop(dst);
            copy
        };
        shared.queue.push(copy)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::stream::{NullSlave, connect};

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn forwards_trimmed_copies() {
        let fifo = Fifo::new(FifoConfig { trim_size: 4, ..FifoConfig::default() }).unwrap();
        let sink = Arc::new(NullSlave::new());
        connect(fifo.as_ref(), sink.clone());

        let frame = Pool::new().accept_req(10, false, 0).unwrap();
        frame.lock().write(0, b"0123456789").unwrap();
        fifo.accept_frame(frame).unwrap();

        wait_for(|| sink.frame_count() == 1);
        assert_eq!(sink.byte_count(), 4);
    }

    #[test]
    fn busy_queue_drops() {
        struct Slow;
        impl Slave for Slow {
            fn accept_frame(&self, _frame: FramePtr) -> Result<()> {
                thread::sleep(Duration::from_millis(50));
                Ok(())
            }
        }

        let fifo = Fifo::new(FifoConfig { max_depth: 1, no_copy: true, ..FifoConfig::default() })
            .unwrap();
        connect(fifo.as_ref(), Arc::new(Slow));

        for _ in 0..10 {
            let frame = Pool::new().accept_req(1, false, 0).unwrap();
            fifo.accept_frame(frame).unwrap();
        }
        assert!(fifo.drop_count() > 0);
        fifo.stop();
    }

    #[test]
    fn config_round_trip() {
        let config = FifoConfig { max_depth: 8, trim_size: 64, no_copy: true };
        let mut bytes = Vec::new();
        ciborium::into_writer(&config, &mut bytes).unwrap();
        let back: FifoConfig = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, config);
    }
}
