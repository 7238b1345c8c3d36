//! Register access through a DMA driver.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use rogue_core::memory::{MemoryError, Slave, SlaveCore, TransactionPtr, TransactionType};
use tracing::{error, trace};

use super::driver::DmaDriver;

const WORD: usize = 4;

/// Memory slave that turns each 32-bit word of a transaction into one
/// register access on the driver.
///
/// Addresses and sizes must be multiples of four. Verify requests are
/// served as reads.
#[derive(Debug)]
pub struct MemMap {
    core: SlaveCore,
    driver: Arc<dyn DmaDriver>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemMap {
    /// Register slave over `driver`.
    pub fn new(driver: Arc<dyn DmaDriver>) -> Self {
        Self {
            core: SlaveCore::new(WORD as u32, 4096),
            driver,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Register reads issued.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Register writes issued.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn access(&self, address: u64, kind: TransactionType, data: &mut [u8]) -> rogue_core::Result<()> {
        for (i, word) in data.chunks_exact_mut(WORD).enumerate() {
            let at = address + (i * WORD) as u64;
            match kind {
                TransactionType::Write | TransactionType::Post => {
                    let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    self.driver.write_register(at, value)?;
                    self.writes.fetch_add(1, Ordering::Relaxed);
                },
                TransactionType::Read | TransactionType::Verify => {
                    word.copy_from_slice(&self.driver.read_register(at)?.to_le_bytes());
                    self.reads.fetch_add(1, Ordering::Relaxed);
                },
            }
        }
        Ok(())
    }
}

impl Slave for MemMap {
    fn core(&self) -> &SlaveCore {
        &self.core
    }

    fn do_transaction(&self, tran: TransactionPtr) {
        let mut lock = tran.lock();
        let address = lock.address();
        let size = lock.data().len();
        if address % WORD as u64 != 0 || size % WORD != 0 {
            trace!(id = tran.id(), address, size, "unaligned register access");
            lock.done(Err(MemoryError::Size));
            return;
        }
        let result = self.access(address, tran.kind(), lock.data_mut());
        match result {
            Ok(()) => lock.done(Ok(())),
            Err(e) => {
                error!(id = tran.id(), address, error = %e, "register access failed");
                lock.done(Err(MemoryError::BusFail));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rogue_core::memory::Transaction;

    use super::*;
    use crate::LoopbackDriver;

    fn run(map: &MemMap, address: u64, data: Vec<u8>, kind: TransactionType) -> TransactionPtr {
        let tran = Transaction::new(address, data, kind, Duration::from_secs(1));
        map.do_transaction(Arc::clone(&tran));
        tran
    }

    #[test]
    fn words_map_to_registers() {
        let driver = Arc::new(LoopbackDriver::new(0, 0, 4));
        let map = MemMap::new(driver.clone());

        let write = run(&map, 0x100, vec![1, 0, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE], TransactionType::Write);
        assert_eq!(write.result(), Some(Ok(())));
        assert_eq!(driver.read_register(0x104).unwrap(), 0xDEAD_BEEF);
        assert_eq!(map.write_count(), 2);

        let read = run(&map, 0x104, vec![0; 4], TransactionType::Read);
        assert_eq!(read.result(), Some(Ok(())));
        assert_eq!(read.take_data(), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn unaligned_access_is_a_size_error() {
        let map = MemMap::new(Arc::new(LoopbackDriver::new(0, 0, 4)));
        let odd_address = run(&map, 0x102, vec![0; 4], TransactionType::Read);
        assert_eq!(odd_address.result(), Some(Err(MemoryError::Size)));
        let odd_size = run(&map, 0x100, vec![0; 6], TransactionType::Write);
        assert_eq!(odd_size.result(), Some(Err(MemoryError::Size)));
        assert_eq!(map.read_count() + map.write_count(), 0);
    }
}
