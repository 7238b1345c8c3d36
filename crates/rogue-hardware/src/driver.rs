//! Driver capability surface.

use std::{fmt, time::Duration};

use parking_lot::Mutex;
use rogue_core::{Error, Result, stream::Region};

/// Number of addressable DMA destinations.
pub const MAX_DEST: u32 = 4096;

/// A received buffer as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxDescriptor {
    /// Buffer index
    pub index: u32,
    /// Bytes written into the buffer
    pub size: usize,
    /// Source destination
    pub dest: u32,
    /// AXI-stream first-user byte
    pub first_user: u8,
    /// AXI-stream last-user byte
    pub last_user: u8,
    /// More buffers of the same frame follow
    pub cont: bool,
    /// Driver error bits, zero when clean
    pub error: u32,
}

/// An outbound buffer handed to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxDescriptor {
    /// Buffer index
    pub index: u32,
    /// Bytes to send from the start of the buffer
    pub size: usize,
    /// Target destination
    pub dest: u32,
    /// AXI-stream first-user byte
    pub first_user: u8,
    /// AXI-stream last-user byte
    pub last_user: u8,
    /// More buffers of the same frame follow
    pub cont: bool,
}

/// Pack user bytes and continuation into the driver flag word.
pub(crate) fn pack_flags(first_user: u8, last_user: u8, cont: bool) -> u32 {
    u32::from(first_user) | (u32::from(last_user) << 8) | (u32::from(cont) << 16)
}

/// Split a driver flag word into `(first_user, last_user, cont)`.
pub(crate) fn unpack_flags(flags: u32) -> (u8, u8, bool) {
    (flags as u8, (flags >> 8) as u8, flags & 0x1_0000 != 0)
}

/// Destinations a driver handle receives from, one bit per destination.
#[derive(Clone, PartialEq, Eq)]
pub struct DestMask([u8; MAX_DEST as usize / 8]);

impl DestMask {
    /// Mask with no destination set.
    pub fn new() -> Self {
        Self([0; MAX_DEST as usize / 8])
    }

    /// Mask selecting a single destination.
    pub fn single(dest: u32) -> Result<Self> {
        let mut mask = Self::new();
        mask.set(dest)?;
        Ok(mask)
    }

    /// Add a destination.
    pub fn set(&mut self, dest: u32) -> Result<()> {
        if dest >= MAX_DEST {
            return Err(Error::boundary("dma destination", dest as usize, MAX_DEST as usize));
        }
        self.0[(dest / 8) as usize] |= 1 << (dest % 8);
        Ok(())
    }

    /// Whether `dest` is selected.
    pub fn contains(&self, dest: u32) -> bool {
        dest < MAX_DEST && self.0[(dest / 8) as usize] & (1 << (dest % 8)) != 0
    }

    /// Raw mask bytes as the driver expects them.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for DestMask {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DestMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dests: Vec<u32> = (0..MAX_DEST).filter(|d| self.contains(*d)).collect();
        f.debug_tuple("DestMask").field(&dests).finish()
    }
}

/// What an adapter needs from a DMA driver.
///
/// Buffers are identified by index. The driver owns the mapped region of
/// every index and lends it out with [`take_region`](Self::take_region);
/// adapters give regions back with [`put_region`](Self::put_region) when
/// the buffer wrapping them drops. Handing an index back to the driver
/// (for reuse, or for transmission) is a separate step.
pub trait DmaDriver: Send + Sync + fmt::Debug {
    /// Number of mapped buffers.
    fn buffer_count(&self) -> usize;

    /// Size of every buffer in bytes.
    fn buffer_size(&self) -> usize;

    /// Borrow the mapped region of `index`.
    fn take_region(&self, index: u32) -> Result<Box<dyn Region>>;

    /// Return a region taken with [`take_region`](Self::take_region).
    fn put_region(&self, index: u32, region: Box<dyn Region>);

    /// Wait up to `timeout` for a received buffer.
    fn read(&self, timeout: Duration) -> Result<Option<RxDescriptor>>;

    /// Wait up to `timeout` for a free transmit buffer.
    fn tx_index(&self, timeout: Duration) -> Result<Option<u32>>;

    /// Send a transmit buffer. The driver reclaims the index.
    fn write(&self, desc: &TxDescriptor) -> Result<()>;

    /// Give an unsent or consumed buffer back to the driver.
    fn ret_index(&self, index: u32) -> Result<()>;

    /// Select the destinations this handle receives from.
    fn set_mask(&self, mask: &DestMask) -> Result<()>;

    /// Read a 32-bit register.
    fn read_register(&self, address: u64) -> Result<u32>;

    /// Write a 32-bit register.
    fn write_register(&self, address: u64, value: u32) -> Result<()>;
}

/// Per-index slots holding regions while the driver owns them.
pub struct RegionTable {
    slots: Mutex<Vec<Option<Box<dyn Region>>>>,
}

impl RegionTable {
    /// Table owning `regions`, indexed by position.
    pub fn new(regions: Vec<Box<dyn Region>>) -> Self {
        Self { slots: Mutex::new(regions.into_iter().map(Some).collect()) }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lend out the region at `index`.
    pub fn take(&self, index: u32) -> Result<Box<dyn Region>> {
        let mut slots = self.slots.lock();
        let count = slots.len();
        let slot = slots
            .get_mut(index as usize)
            .ok_or(Error::boundary("dma index", index as usize, count))?;
        slot.take()
            .ok_or_else(|| Error::Protocol(format!("dma buffer {index} is already lent out")))
    }

    /// Put a lent region back.
    pub fn put(&self, index: u32, region: Box<dyn Region>) {
        if let Some(slot) = self.slots.lock().get_mut(index as usize) {
            *slot = Some(region);
        }
    }

    /// Run `f` on the region at `index` while the table holds it.
    pub fn with<R>(&self, index: u32, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut slots = self.slots.lock();
        match slots.get_mut(index as usize) {
            Some(Some(region)) => Ok(f(region.as_mut_slice())),
            Some(None) => {
                Err(Error::Protocol(format!("dma buffer {index} is lent out")))
            },
            None => Err(Error::boundary("dma index", index as usize, slots.len())),
        }
    }
}

impl fmt::Debug for RegionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        let held = slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("RegionTable").field("len", &slots.len()).field("held", &held).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let flags = pack_flags(0x02, 0x01, true);
        assert_eq!(flags, 0x0001_0102);
        assert_eq!(unpack_flags(flags), (0x02, 0x01, true));
        assert_eq!(unpack_flags(pack_flags(7, 0, false)), (7, 0, false));
    }

    #[test]
    fn mask_bits() {
        let mut mask = DestMask::single(0).unwrap();
        mask.set(257).unwrap();
        assert!(mask.contains(0) && mask.contains(257));
        assert!(!mask.contains(1));
        assert_eq!(mask.as_bytes()[32], 0x02);
        assert!(mask.set(MAX_DEST).is_err());
    }

    #[test]
    fn table_lends_each_region_once() {
        let table = RegionTable::new(vec![Box::new(vec![0u8; 8]), Box::new(vec![0u8; 8])]);
        let region = table.take(1).unwrap();
        assert!(table.take(1).is_err());
        assert!(table.with(1, |_| ()).is_err());
        table.put(1, region);
        assert_eq!(table.with(1, |bytes| bytes.len()).unwrap(), 8);
        assert!(table.take(2).is_err());
    }
}
