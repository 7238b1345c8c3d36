//! Sparse RAM slave.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tracing::trace;

use super::{
    error::MemoryError,
    slave::{Slave, SlaveCore},
    transaction::{TransactionPtr, TransactionType},
};

const PAGE_SIZE: u64 = 4096;

/// Whether `len` bytes from `address` stay below the top of the 64-bit space.
fn fits(address: u64, len: usize) -> bool {
    len == 0 || address.checked_add(len as u64 - 1).is_some()
}

/// Memory slave backed by sparse 4 KiB pages.
///
/// Unwritten memory reads as zero. Verify requests arriving here are treated
/// as reads.
#[derive(Debug)]
pub struct Emulator {
    core: SlaveCore,
    pages: Mutex<HashMap<u64, Box<[u8]>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Emulator {
    /// RAM with the given access constraints.
    pub fn new(min_access: u32, max_access: u32) -> Self {
        Self {
            core: SlaveCore::new(min_access, max_access),
            pages: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Read `len` bytes without going through a transaction.
    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.load(address, &mut out);
        out
    }

    /// Write bytes without going through a transaction.
    pub fn poke(&self, address: u64, data: &[u8]) {
        self.store(address, data);
    }

    /// Read transactions served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Write transactions served.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Bytes of backing memory allocated.
    pub fn total_alloc(&self) -> u64 {
        self.pages.lock().len() as u64 * PAGE_SIZE
    }

    fn load(&self, address: u64, dst: &mut [u8]) {
        let pages = self.pages.lock();
        let mut done = 0;
        while done < dst.len() {
            let at = address.wrapping_add(done as u64);
            let (page, offset) = (at / PAGE_SIZE, (at % PAGE_SIZE) as usize);
            let count = (PAGE_SIZE as usize - offset).min(dst.len() - done);
            match pages.get(&page) {
                Some(bytes) => dst[done..done + count].copy_from_slice(&bytes[offset..offset + count]),
                None => dst[done..done + count].fill(0),
            }
            done += count;
        }
    }

    fn store(&self, address: u64, src: &[u8]) {
        let mut pages = self.pages.lock();
        let mut done = 0;
        while done < src.len() {
            let at = address.wrapping_add(done as u64);
            let (page, offset) = (at / PAGE_SIZE, (at % PAGE_SIZE) as usize);
            let count = (PAGE_SIZE as usize - offset).min(src.len() - done);
            let bytes = pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            bytes[offset..offset + count].copy_from_slice(&src[done..done + count]);
            done += count;
        }
    }
}

impl Slave for Emulator {
    fn core(&self) -> &SlaveCore {
        &self.core
    }

    fn do_transaction(&self, tran: TransactionPtr) {
        let mut lock = tran.lock();
        let address = lock.address();
        if !fits(address, lock.data().len()) {
            trace!(id = tran.id(), address, "access wraps the address space");
            lock.done(Err(MemoryError::Address));
            return;
        }
        match tran.kind() {
            TransactionType::Write | TransactionType::Post => {
                self.store(address, lock.data());
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            TransactionType::Read | TransactionType::Verify => {
                self.load(address, lock.data_mut());
                self.reads.fetch_add(1, Ordering::Relaxed);
            }
        }
        trace!(id = tran.id(), address, kind = ?tran.kind(), "emulator served");
        lock.done(Ok(()));
    }
}
