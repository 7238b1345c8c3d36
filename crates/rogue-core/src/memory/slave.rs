//! Transaction executors.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::warn;

use super::{
    error::MemoryError,
    transaction::{Transaction, TransactionPtr},
};

static NEXT_SLAVE_ID: AtomicU32 = AtomicU32::new(1);

/// State every memory slave carries: identity, access constraints and the
/// weak map of in-flight transactions.
#[derive(Debug)]
pub struct SlaveCore {
    id: u32,
    min_access: u32,
    max_access: u32,
    transactions: Mutex<HashMap<u32, Weak<Transaction>>>,
}

impl SlaveCore {
    /// Core with a fresh slave id.
    pub fn new(min_access: u32, max_access: u32) -> Self {
        Self {
            id: NEXT_SLAVE_ID.fetch_add(1, Ordering::Relaxed),
            min_access,
            max_access,
            transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Slave id, unique per process.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Smallest access in bytes.
    pub fn min_access(&self) -> u32 {
        self.min_access
    }

    /// Largest access in bytes.
    pub fn max_access(&self) -> u32 {
        self.max_access
    }

    /// Remember `tran` for asynchronous completion.
    pub fn add_transaction(&self, tran: &TransactionPtr) {
        let mut map = self.transactions.lock();
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(tran.id(), Arc::downgrade(tran));
    }

    /// Look up an in-flight transaction. Entries whose master has dropped
    /// the transaction are discarded.
    pub fn get_transaction(&self, id: u32) -> Option<TransactionPtr> {
        let mut map = self.transactions.lock();
        let tran = map.get(&id)?.upgrade();
        if tran.is_none() {
            map.remove(&id);
        }
        tran
    }

    /// Forget a transaction.
    pub fn del_transaction(&self, id: u32) {
        self.transactions.lock().remove(&id);
    }

    /// Number of live in-flight transactions.
    pub fn pending(&self) -> usize {
        self.transactions.lock().values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Executor of memory transactions.
///
/// Implementors provide [`core`](Self::core) and usually
/// [`do_transaction`](Self::do_transaction); everything else has a default
/// that reads the core.
pub trait Slave: Send + Sync {
    /// Identity, constraints and transaction map.
    fn core(&self) -> &SlaveCore;

    /// Execute `tran`, completing it now or later. The default rejects it.
    fn do_transaction(&self, tran: TransactionPtr) {
        warn!(id = tran.id(), slave = self.core().id(), "slave does not support transactions");
        tran.error(MemoryError::Unsupported);
    }

    /// Smallest access in bytes.
    fn min_access(&self) -> u32 {
        self.core().min_access()
    }

    /// Largest access in bytes.
    fn max_access(&self) -> u32 {
        self.core().max_access()
    }

    /// Slave id.
    fn slave_id(&self) -> u32 {
        self.core().id()
    }

    /// Base address of this slave's space.
    fn address(&self) -> u64 {
        0
    }

    /// Remember `tran` for asynchronous completion.
    fn add_transaction(&self, tran: &TransactionPtr) {
        self.core().add_transaction(tran);
    }

    /// Look up an in-flight transaction.
    fn get_transaction(&self, id: u32) -> Option<TransactionPtr> {
        self.core().get_transaction(id)
    }

    /// Forget a transaction.
    fn del_transaction(&self, id: u32) {
        self.core().del_transaction(id);
    }

    /// Next slave in a hub chain.
    fn downstream(&self) -> Option<Arc<dyn Slave>> {
        None
    }
}

impl std::fmt::Debug for dyn Slave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slave({})", self.slave_id())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::TransactionType;

    struct Bare(SlaveCore);

    impl Slave for Bare {
        fn core(&self) -> &SlaveCore {
            &self.0
        }
    }

    #[test]
    fn default_rejects() {
        let slave = Bare(SlaveCore::new(4, 4));
        let tran = Transaction::new(0, vec![0; 4], TransactionType::Read, Duration::from_secs(1));
        slave.do_transaction(Arc::clone(&tran));
        assert_eq!(tran.result(), Some(Err(MemoryError::Unsupported)));
    }

    #[test]
    fn weak_map_does_not_keep_transactions_alive() {
        let core = SlaveCore::new(4, 4);
        let tran = Transaction::new(0, vec![0; 4], TransactionType::Read, Duration::from_secs(1));
        let id = tran.id();
        core.add_transaction(&tran);
        assert!(core.get_transaction(id).is_some());
        assert_eq!(core.pending(), 1);

        drop(tran);
        assert!(core.get_transaction(id).is_none());
        assert_eq!(core.pending(), 0);
    }

    #[test]
    fn slave_ids_are_distinct() {
        assert_ne!(SlaveCore::new(1, 1).id(), SlaveCore::new(1, 1).id());
    }
}
