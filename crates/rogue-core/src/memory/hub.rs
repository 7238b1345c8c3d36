//! Address-translating pass-through.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{
    error::MemoryError,
    slave::{Slave, SlaveCore},
    transaction::TransactionPtr,
};
use crate::error::{Error, Result};

/// Forwards transactions downstream with its offset OR'd into the address.
///
/// Constraint queries and the transaction map are delegated to the
/// downstream slave so a master talking through a chain of hubs sees the
/// leaf's constraints.
#[derive(Debug)]
pub struct Hub {
    core: SlaveCore,
    offset: u64,
    downstream: RwLock<Option<Arc<dyn Slave>>>,
}

impl Hub {
    /// Hub adding `offset` to every address.
    pub fn new(offset: u64) -> Self {
        Self { core: SlaveCore::new(0, 0), offset, downstream: RwLock::new(None) }
    }

    /// The hub's offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Install the downstream slave.
    ///
    /// Fails with [`Error::Cycle`] when the hub itself is reachable from
    /// `slave`.
    pub fn set_slave(&self, slave: Arc<dyn Slave>) -> Result<()> {
        let mut node = Some(Arc::clone(&slave));
        while let Some(current) = node {
            if current.core().id() == self.core.id() {
                warn!(hub = self.core.id(), "rejecting cyclic hub connection");
                return Err(Error::Cycle);
            }
            node = current.downstream();
        }
        debug!(hub = self.core.id(), offset = self.offset, slave = slave.slave_id(), "hub connected");
        *self.downstream.write() = Some(slave);
        Ok(())
    }

    fn slave(&self) -> Option<Arc<dyn Slave>> {
        self.downstream.read().clone()
    }
}

impl Slave for Hub {
    fn core(&self) -> &SlaveCore {
        &self.core
    }

    fn do_transaction(&self, tran: TransactionPtr) {
        {
            let mut lock = tran.lock();
            let address = lock.address() | self.offset;
            lock.set_address(address);
        }
        match self.slave() {
            Some(slave) => slave.do_transaction(tran),
            None => tran.error(MemoryError::Unsupported),
        }
    }

    fn min_access(&self) -> u32 {
        self.slave().map_or(self.core.min_access(), |s| s.min_access())
    }

    fn max_access(&self) -> u32 {
        self.slave().map_or(self.core.max_access(), |s| s.max_access())
    }

    fn address(&self) -> u64 {
        self.offset | self.slave().map_or(0, |s| s.address())
    }

    fn add_transaction(&self, tran: &TransactionPtr) {
        match self.slave() {
            Some(slave) => slave.add_transaction(tran),
            None => self.core.add_transaction(tran),
        }
    }

    fn get_transaction(&self, id: u32) -> Option<TransactionPtr> {
        match self.slave() {
            Some(slave) => slave.get_transaction(id),
            None => self.core.get_transaction(id),
        }
    }

    fn del_transaction(&self, id: u32) {
        match self.slave() {
            Some(slave) => slave.del_transaction(id),
            None => self.core.del_transaction(id),
        }
    }

    fn downstream(&self) -> Option<Arc<dyn Slave>> {
        self.slave()
    }
}
