//! Register transactions.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use super::error::MemoryError;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    loop {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    /// Read `size` bytes
    Read,
    /// Write and wait for the acknowledgement
    Write,
    /// Write without acknowledgement
    Post,
    /// Write, read back and compare
    Verify,
}

/// Shared handle to a transaction.
pub type TransactionPtr = Arc<Transaction>;

#[derive(Debug)]
struct State {
    address: u64,
    data: Vec<u8>,
    result: Option<Result<(), MemoryError>>,
    end: Option<Instant>,
}

/// One register access in flight.
///
/// The id is process-unique and never zero. Address and data sit behind the
/// transaction's lock; hubs rewrite the address and slaves fill or consume
/// the data while holding it. Completion is one-shot: the first
/// [`done`](Self::done) wins and later calls are ignored.
pub struct Transaction {
    id: u32,
    kind: TransactionType,
    size: u32,
    timeout: Duration,
    start: Instant,
    state: Mutex<State>,
    done_cv: Condvar,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// New transaction owning `data` (its length is the transfer size).
    pub fn new(address: u64, data: Vec<u8>, kind: TransactionType, timeout: Duration) -> TransactionPtr {
        Arc::new(Self {
            id: next_id(),
            kind,
            size: data.len() as u32,
            timeout,
            start: Instant::now(),
            state: Mutex::new(State { address, data, result: None, end: None }),
            done_cv: Condvar::new(),
        })
    }

    /// Transaction id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Transaction kind.
    pub fn kind(&self) -> TransactionType {
        self.kind
    }

    /// Transfer size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Time budget from creation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Creation time.
    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// Completion time, once done.
    pub fn end_time(&self) -> Option<Instant> {
        self.state.lock().end
    }

    /// Current address.
    pub fn address(&self) -> u64 {
        self.state.lock().address
    }

    /// Acquire the transaction lock.
    pub fn lock(&self) -> TransactionLock<'_> {
        TransactionLock { guard: self.state.lock(), tran: self }
    }

    /// Complete the transaction. Ignored if already complete.
    pub fn done(&self, result: Result<(), MemoryError>) {
        self.lock().done(result);
    }

    /// Complete with an error.
    pub fn error(&self, error: MemoryError) {
        self.done(Err(error));
    }

    /// Whether the transaction has completed.
    pub fn is_done(&self) -> bool {
        self.state.lock().result.is_some()
    }

    /// Completion result, once done.
    pub fn result(&self) -> Option<Result<(), MemoryError>> {
        self.state.lock().result
    }

    /// Whether `now` is past the deadline.
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start) > self.timeout
    }

    /// Block until done or `deadline`. Returns whether it completed.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while state.result.is_none() {
            if self.done_cv.wait_until(&mut state, deadline).timed_out() {
                return state.result.is_some();
            }
        }
        true
    }

    /// Move the data out, leaving an empty buffer.
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().data)
    }
}

/// Exclusive access to a transaction's address and data.
pub struct TransactionLock<'a> {
    guard: MutexGuard<'a, State>,
    tran: &'a Transaction,
}

impl fmt::Debug for TransactionLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionLock")
            .field("id", &self.tran.id)
            .field("address", &format_args!("{:#x}", self.guard.address))
            .finish_non_exhaustive()
    }
}

impl TransactionLock<'_> {
    /// The locked transaction.
    pub fn transaction(&self) -> &Transaction {
        self.tran
    }

    /// Current address.
    pub fn address(&self) -> u64 {
        self.guard.address
    }

    /// Rewrite the address.
    pub fn set_address(&mut self, address: u64) {
        self.guard.address = address;
    }

    /// Backing data.
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    /// Backing data, mutable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard.data
    }

    /// Whether the transaction has completed.
    pub fn is_done(&self) -> bool {
        self.guard.result.is_some()
    }

    /// Complete the transaction and release the lock.
    pub fn done(mut self, result: Result<(), MemoryError>) {
        if self.guard.result.is_some() {
            return;
        }
        self.guard.result = Some(result);
        self.guard.end = Some(Instant::now());
        trace!(id = self.tran.id, ?result, "transaction done");
        drop(self.guard);
        self.tran.done_cv.notify_all();
    }
}
