//! Sinks that record what reaches them.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rogue_core::{
    Result,
    memory::{self, Emulator, Slave as _, SlaveCore, TransactionPtr, TransactionType},
    stream::{FramePtr, Slave},
};

/// One frame as seen by a [`Collector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Frame channel
    pub channel: u8,
    /// Frame error field
    pub error: u8,
    /// First-user byte
    pub first_user: u8,
    /// Last-user byte
    pub last_user: u8,
    /// Payload bytes
    pub data: Vec<u8>,
}

/// Stream sink that keeps a copy of every frame.
#[derive(Debug, Default)]
pub struct Collector {
    frames: Mutex<Vec<Received>>,
    cv: Condvar,
}

impl Collector {
    /// Empty collector, ready to attach.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Frames received so far.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether nothing arrived yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything received.
    pub fn frames(&self) -> Vec<Received> {
        self.frames.lock().clone()
    }

    /// Payloads of everything received.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.frames.lock().iter().map(|f| f.data.clone()).collect()
    }

    /// Remove and return everything received.
    pub fn take(&self) -> Vec<Received> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Block until at least `count` frames arrived or `timeout` passed.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        while frames.len() < count {
            if self.cv.wait_until(&mut frames, deadline).timed_out() {
                return frames.len() >= count;
            }
        }
        true
    }
}

impl Slave for Collector {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let lock = frame.lock();
        let received = Received {
            channel: lock.channel(),
            error: lock.error(),
            first_user: lock.first_user(),
            last_user: lock.last_user(),
            data: lock.to_vec(),
        };
        drop(lock);
        self.frames.lock().push(received);
        self.cv.notify_all();
        Ok(())
    }
}

/// One transaction as seen by a [`TransactionLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Address after every hub on the way
    pub address: u64,
    /// Transaction type
    pub kind: TransactionType,
    /// Data carried in (writes) or the read size in zero bytes
    pub data: Vec<u8>,
}

/// Memory slave that records every transaction and serves it from RAM.
#[derive(Debug)]
pub struct TransactionLog {
    core: SlaveCore,
    ram: Emulator,
    log: Mutex<Vec<TransactionRecord>>,
}

impl TransactionLog {
    /// Log with 4-byte minimum and 4 KiB maximum accesses.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { core: SlaveCore::new(4, 4096), ram: Emulator::new(4, 4096), log: Mutex::new(Vec::new()) })
    }

    /// Transactions seen so far.
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.log.lock().clone()
    }

    /// Backing RAM.
    pub fn ram(&self) -> &Emulator {
        &self.ram
    }
}

impl memory::Slave for TransactionLog {
    fn core(&self) -> &SlaveCore {
        &self.core
    }

    fn do_transaction(&self, tran: TransactionPtr) {
        let record = {
            let lock = tran.lock();
            TransactionRecord { address: lock.address(), kind: tran.kind(), data: lock.data().to_vec() }
        };
        self.log.lock().push(record);
        self.ram.do_transaction(tran);
    }
}
