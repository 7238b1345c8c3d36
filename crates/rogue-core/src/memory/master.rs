//! Transaction issuer.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{
    error::MemoryError,
    slave::Slave,
    transaction::{Transaction, TransactionPtr, TransactionType},
};

/// Transaction budget used until [`Master::set_timeout`] is called.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Pending {
    tran: TransactionPtr,
    /// Original address and expected data of a verify request
    verify: Option<(u64, Vec<u8>)>,
}

/// Issues transactions to one slave and tracks them until waited on.
///
/// The master is the sole strong owner of every transaction it issues. A
/// verify request is sent as a write; waiting on it reads the range back
/// into a shadow buffer and compares.
#[derive(Debug)]
pub struct Master {
    slave: RwLock<Option<Arc<dyn Slave>>>,
    pending: Mutex<HashMap<u32, Pending>>,
    timeout: Mutex<Duration>,
    error: AtomicU32,
}

impl Default for Master {
    fn default() -> Self {
        Self::new()
    }
}

impl Master {
    /// Master with no slave and the default timeout.
    pub fn new() -> Self {
        Self {
            slave: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            timeout: Mutex::new(DEFAULT_TIMEOUT),
            error: AtomicU32::new(0),
        }
    }

    /// Attach the slave that executes this master's transactions.
    pub fn set_slave(&self, slave: Arc<dyn Slave>) {
        *self.slave.write() = Some(slave);
    }

    /// The attached slave.
    pub fn slave(&self) -> Option<Arc<dyn Slave>> {
        self.slave.read().clone()
    }

    /// Set the per-transaction budget in microseconds.
    pub fn set_timeout(&self, micros: u64) {
        *self.timeout.lock() = Duration::from_micros(micros);
    }

    /// Per-transaction budget.
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Return and clear the latched error bitset.
    pub fn get_error(&self) -> u32 {
        self.error.swap(0, Ordering::AcqRel)
    }

    /// Slave's smallest access, or 0 without a slave.
    pub fn req_min_access(&self) -> u32 {
        self.slave().map_or(0, |s| s.min_access())
    }

    /// Slave's largest access, or 0 without a slave.
    pub fn req_max_access(&self) -> u32 {
        self.slave().map_or(0, |s| s.max_access())
    }

    /// Slave id, or 0 without a slave.
    pub fn req_slave_id(&self) -> u32 {
        self.slave().map_or(0, |s| s.slave_id())
    }

    /// Slave base address, or 0 without a slave.
    pub fn req_address(&self) -> u64 {
        self.slave().map_or(0, |s| s.address())
    }

    /// Number of transactions not yet waited on.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Issue a transaction and return its id.
    ///
    /// `data` is the backing buffer: the bytes to write, or a buffer of the
    /// read size. Posted writes complete as soon as the slave returns.
    pub fn req_transaction(&self, address: u64, data: Vec<u8>, kind: TransactionType) -> u32 {
        let (wire_kind, verify) = match kind {
            TransactionType::Verify => (TransactionType::Write, Some((address, data.clone()))),
            other => (other, None),
        };
        let size = data.len();
        let tran = Transaction::new(address, data, wire_kind, self.timeout());
        let id = tran.id();
        self.pending.lock().insert(id, Pending { tran: Arc::clone(&tran), verify });

        let Some(slave) = self.slave() else {
            warn!(id, "transaction issued with no slave attached");
            tran.error(MemoryError::Unsupported);
            return id;
        };
        if let Err(e) = check_access(slave.as_ref(), address, size) {
            debug!(id, address, size, error = %e, "transaction rejected");
            tran.error(e);
            return id;
        }

        slave.add_transaction(&tran);
        slave.do_transaction(Arc::clone(&tran));
        if wire_kind == TransactionType::Post {
            tran.done(Ok(()));
        }
        id
    }

    /// Wait for transaction `id` and return its data.
    ///
    /// With `id == 0` waits for every outstanding transaction and returns an
    /// empty buffer (or the first error). Unknown ids return an empty buffer.
    pub fn wait_transaction(&self, id: u32) -> Result<Vec<u8>, MemoryError> {
        if id == 0 {
            return self.wait_all().map(|()| Vec::new());
        }
        let Some(pending) = self.pending.lock().remove(&id) else {
            return Ok(Vec::new());
        };

        let mut result = self.complete(&pending.tran);
        let data = pending.tran.take_data();
        if let (Ok(()), Some((address, expected))) = (result, pending.verify) {
            result = self.verify(address, &expected);
        }

        match result {
            Ok(()) => Ok(data),
            Err(e) => {
                self.error.fetch_or(e.code(), Ordering::AcqRel);
                warn!(id, address = pending.tran.address(), error = %e, "transaction failed");
                Err(e)
            }
        }
    }

    /// Wait for every outstanding transaction.
    pub fn wait_all(&self) -> Result<(), MemoryError> {
        let mut ids: Vec<u32> = self.pending.lock().keys().copied().collect();
        ids.sort_unstable();
        let mut first = Ok(());
        for id in ids {
            if let Err(e) = self.wait_transaction(id) {
                first = first.and(Err(e));
            }
        }
        first
    }

    fn complete(&self, tran: &Transaction) -> Result<(), MemoryError> {
        let deadline = tran.start_time() + tran.timeout();
        if !tran.wait_until(deadline) {
            tran.error(MemoryError::Timeout);
            if let Some(slave) = self.slave() {
                slave.del_transaction(tran.id());
            }
        }
        tran.result().unwrap_or(Err(MemoryError::Timeout))
    }

    fn verify(&self, address: u64, expected: &[u8]) -> Result<(), MemoryError> {
        let shadow = self.read(address, expected.len() as u32)?;
        if shadow == expected {
            Ok(())
        } else {
            Err(MemoryError::Verify)
        }
    }

    /// Blocking read of `size` bytes.
    pub fn read(&self, address: u64, size: u32) -> Result<Vec<u8>, MemoryError> {
        let id = self.req_transaction(address, vec![0; size as usize], TransactionType::Read);
        self.wait_transaction(id)
    }

    /// Blocking write.
    pub fn write(&self, address: u64, data: Vec<u8>) -> Result<(), MemoryError> {
        let id = self.req_transaction(address, data, TransactionType::Write);
        self.wait_transaction(id).map(|_| ())
    }

    /// Blocking write followed by read-back comparison.
    pub fn write_verify(&self, address: u64, data: Vec<u8>) -> Result<(), MemoryError> {
        let id = self.req_transaction(address, data, TransactionType::Verify);
        self.wait_transaction(id).map(|_| ())
    }

    /// Posted write; returns once the slave has accepted it.
    pub fn post(&self, address: u64, data: Vec<u8>) -> Result<(), MemoryError> {
        let id = self.req_transaction(address, data, TransactionType::Post);
        self.wait_transaction(id).map(|_| ())
    }
}

fn check_access(slave: &dyn Slave, address: u64, size: usize) -> Result<(), MemoryError> {
    let (min, max) = (slave.min_access() as usize, slave.max_access() as usize);
    if size == 0 || (max > 0 && size > max) {
        return Err(MemoryError::Size);
    }
    if min > 1 {
        if address % min as u64 != 0 {
            return Err(MemoryError::Address);
        }
        if size % min != 0 {
            return Err(MemoryError::Size);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;
    use crate::memory::{Emulator, SlaveCore};

    /// Accepts transactions and never completes them.
    struct BlackHole(SlaveCore);

    impl Slave for BlackHole {
        fn core(&self) -> &SlaveCore {
            &self.0
        }

        fn do_transaction(&self, _tran: TransactionPtr) {}
    }

    /// Completes from another thread after a delay.
    struct Deferred(SlaveCore);

    impl Slave for Deferred {
        fn core(&self) -> &SlaveCore {
            &self.0
        }

        fn do_transaction(&self, tran: TransactionPtr) {
            let id = tran.id();
            drop(tran);
            let slave_tran = self.get_transaction(id);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                if let Some(tran) = slave_tran {
                    let mut lock = tran.lock();
                    lock.data_mut().fill(0x5A);
                    lock.done(Ok(()));
                }
            });
        }
    }

    #[test]
    fn read_write_round_trip() {
        let master = Master::new();
        master.set_slave(Arc::new(Emulator::new(4, 1024)));
        master.write(0x20, vec![0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(master.read(0x20, 4).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(master.get_error(), 0);
    }

    #[test]
    fn timeout_completes_transaction() {
        let master = Master::new();
        master.set_timeout(5_000);
        master.set_slave(Arc::new(BlackHole(SlaveCore::new(1, 16))));

        let start = Instant::now();
        assert_eq!(master.read(0, 4), Err(MemoryError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert_eq!(master.get_error(), MemoryError::Timeout.code());
        assert_eq!(master.get_error(), 0);
        assert_eq!(master.pending(), 0);
    }

    #[test]
    fn asynchronous_completion_through_weak_map() {
        let master = Master::new();
        master.set_slave(Arc::new(Deferred(SlaveCore::new(1, 16))));
        assert_eq!(master.read(0, 4).unwrap(), vec![0x5A; 4]);
    }

    #[test]
    fn posted_write_completes_immediately() {
        let master = Master::new();
        master.set_slave(Arc::new(BlackHole(SlaveCore::new(1, 16))));
        master.post(0, vec![1, 2]).unwrap();
    }

    #[test]
    fn access_constraints() {
        let master = Master::new();
        master.set_slave(Arc::new(Emulator::new(4, 8)));
        assert_eq!(master.write(0x2, vec![0; 4]), Err(MemoryError::Address));
        assert_eq!(master.write(0x0, vec![0; 6]), Err(MemoryError::Size));
        assert_eq!(master.write(0x0, vec![0; 12]), Err(MemoryError::Size));
        assert_eq!(
            master.get_error(),
            MemoryError::Address.code() | MemoryError::Size.code()
        );
    }

    #[test]
    fn verify_detects_mismatch() {
        /// RAM whose bit 0 is stuck low.
        struct Stuck(Emulator);

        impl Slave for Stuck {
            fn core(&self) -> &SlaveCore {
                self.0.core()
            }

            fn do_transaction(&self, tran: TransactionPtr) {
                if tran.kind() == TransactionType::Write {
                    tran.lock().data_mut().iter_mut().for_each(|b| *b &= !1);
                }
                self.0.do_transaction(tran);
            }
        }

        let master = Master::new();
        master.set_slave(Arc::new(Stuck(Emulator::new(1, 16))));
        master.write_verify(0, vec![2, 4]).unwrap();
        assert_eq!(master.write_verify(0, vec![1, 3]), Err(MemoryError::Verify));
    }

    #[test]
    fn wait_all_collects_everything() {
        let master = Master::new();
        master.set_slave(Arc::new(Emulator::new(4, 16)));
        for i in 0..4u64 {
            master.req_transaction(i * 4, vec![i as u8; 4], TransactionType::Write);
        }
        assert_eq!(master.pending(), 4);
        assert_eq!(master.wait_transaction(0), Ok(Vec::new()));
        assert_eq!(master.pending(), 0);
    }

    #[test]
    fn no_slave_is_unsupported() {
        let master = Master::new();
        assert_eq!(master.read(0, 4), Err(MemoryError::Unsupported));
    }
}
