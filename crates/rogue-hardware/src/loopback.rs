//! In-memory DMA driver.

use std::{
    collections::{HashMap, VecDeque},
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rogue_core::{Error, Result, stream::Region};
use tracing::{debug, trace};

use super::driver::{DestMask, DmaDriver, RegionTable, RxDescriptor, TxDescriptor};

#[derive(Debug, Default)]
struct State {
    free_rx: VecDeque<u32>,
    free_tx: VecDeque<u32>,
    ready: VecDeque<RxDescriptor>,
    mask: Option<DestMask>,
}

/// Driver whose transmit buffers loop back as received buffers.
///
/// Buffers `0..rx_count` form the receive ring and the rest the transmit
/// ring. Every write is copied into a free receive buffer and queued for
/// [`read`](DmaDriver::read), provided the destination passes the mask.
/// Registers live in a sparse map that reads zero until written.
#[derive(Debug)]
pub struct LoopbackDriver {
    size: usize,
    rx_count: u32,
    regions: RegionTable,
    spans: Vec<Range<usize>>,
    state: Mutex<State>,
    ready_cv: Condvar,
    tx_cv: Condvar,
    registers: Mutex<HashMap<u64, u32>>,
    dropped: AtomicU64,
}

impl LoopbackDriver {
    /// Driver with `rx_count` receive and `tx_count` transmit buffers of
    /// `size` bytes each.
    pub fn new(rx_count: usize, tx_count: usize, size: usize) -> Self {
        let total = rx_count + tx_count;
        let memory: Vec<Vec<u8>> = (0..total).map(|_| vec![0u8; size]).collect();
        let spans = memory
            .iter()
            .map(|m| {
                let start = m.as_ptr() as usize;
                start..start + m.len()
            })
            .collect();
        let regions: Vec<Box<dyn Region>> =
            memory.into_iter().map(|m| Box::new(m) as Box<dyn Region>).collect();
        let state = State {
            free_rx: (0..rx_count as u32).collect(),
            free_tx: ((rx_count as u32)..(total as u32)).collect(),
            ..State::default()
        };
        Self {
            size,
            rx_count: rx_count as u32,
            regions: RegionTable::new(regions),
            spans,
            state: Mutex::new(state),
            ready_cv: Condvar::new(),
            tx_cv: Condvar::new(),
            registers: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Deliver `data` as if the device had sent it from `dest`. Data larger
    /// than one buffer spans several, chained with the continuation flag.
    pub fn inject(&self, dest: u32, first_user: u8, last_user: u8, data: &[u8]) -> Result<()> {
        let chunks: Vec<&[u8]> =
            if data.is_empty() { vec![data] } else { data.chunks(self.size).collect() };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let desc = RxDescriptor {
                index: 0,
                size: chunk.len(),
                dest,
                first_user: if i == 0 { first_user } else { 0 },
                last_user: if i == last { last_user } else { 0 },
                cont: i < last,
                error: 0,
            };
            self.receive(desc, chunk)?;
        }
        Ok(())
    }

    /// Writes dropped for lack of a receive buffer or by the mask.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether `ptr` points into one of the mapped regions.
    pub fn maps(&self, ptr: *const u8) -> bool {
        let at = ptr as usize;
        self.spans.iter().any(|span| span.contains(&at))
    }

    /// Free receive buffers.
    pub fn free_rx(&self) -> usize {
        self.state.lock().free_rx.len()
    }

    /// Free transmit buffers.
    pub fn free_tx(&self) -> usize {
        self.state.lock().free_tx.len()
    }

    fn receive(&self, mut desc: RxDescriptor, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.mask.as_ref().is_some_and(|mask| !mask.contains(desc.dest)) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(dest = desc.dest, "destination masked off");
            return Ok(());
        }
        let Some(index) = state.free_rx.pop_front() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(dest = desc.dest, "receive ring full");
            return Ok(());
        };
        self.regions.with(index, |region| region[..data.len()].copy_from_slice(data))?;
        desc.index = index;
        state.ready.push_back(desc);
        drop(state);
        self.ready_cv.notify_one();
        Ok(())
    }
}

impl DmaDriver for LoopbackDriver {
    fn buffer_count(&self) -> usize {
        self.regions.len()
    }

    fn buffer_size(&self) -> usize {
        self.size
    }

    fn take_region(&self, index: u32) -> Result<Box<dyn Region>> {
        self.regions.take(index)
    }

    fn put_region(&self, index: u32, region: Box<dyn Region>) {
        self.regions.put(index, region);
    }

    fn read(&self, timeout: Duration) -> Result<Option<RxDescriptor>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.ready.is_empty() {
            if self.ready_cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Ok(state.ready.pop_front())
    }

    fn tx_index(&self, timeout: Duration) -> Result<Option<u32>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.free_tx.is_empty() {
            if self.tx_cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Ok(state.free_tx.pop_front())
    }

    fn write(&self, desc: &TxDescriptor) -> Result<()> {
        if desc.index < self.rx_count {
            return Err(Error::Protocol(format!("buffer {} is not a transmit buffer", desc.index)));
        }
        if desc.size > self.size {
            self.ret_index(desc.index)?;
            return Err(Error::boundary("dma write", desc.size, self.size));
        }
        let data = self.regions.with(desc.index, |region| region[..desc.size].to_vec());
        self.ret_index(desc.index)?;
        let rx = RxDescriptor {
            index: 0,
            size: desc.size,
            dest: desc.dest,
            first_user: desc.first_user,
            last_user: desc.last_user,
            cont: desc.cont,
            error: 0,
        };
        self.receive(rx, &data?)
    }

    fn ret_index(&self, index: u32) -> Result<()> {
        if index as usize >= self.regions.len() {
            return Err(Error::boundary("dma index", index as usize, self.regions.len()));
        }
        let mut state = self.state.lock();
        if index < self.rx_count {
            state.free_rx.push_back(index);
        } else {
            state.free_tx.push_back(index);
            drop(state);
            self.tx_cv.notify_one();
        }
        Ok(())
    }

    fn set_mask(&self, mask: &DestMask) -> Result<()> {
        self.state.lock().mask = Some(mask.clone());
        Ok(())
    }

    fn read_register(&self, address: u64) -> Result<u32> {
        Ok(self.registers.lock().get(&address).copied().unwrap_or(0))
    }

    fn write_register(&self, address: u64, value: u32) -> Result<()> {
        self.registers.lock().insert(address, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_loops_back_to_read() {
        let driver = LoopbackDriver::new(2, 2, 64);
        let index = driver.tx_index(Duration::ZERO).unwrap().unwrap();
        assert!(index >= 2);
        driver.regions.with(index, |region| region[..3].copy_from_slice(b"abc")).unwrap();
        driver
            .write(&TxDescriptor { index, size: 3, dest: 5, first_user: 2, ..TxDescriptor::default() })
            .unwrap();
        assert_eq!(driver.free_tx(), 2);

        let desc = driver.read(Duration::ZERO).unwrap().unwrap();
        assert_eq!((desc.size, desc.dest, desc.first_user), (3, 5, 2));
        assert_eq!(driver.regions.with(desc.index, |r| r[..3].to_vec()).unwrap(), b"abc");
        assert_eq!(driver.free_rx(), 1);
        driver.ret_index(desc.index).unwrap();
        assert_eq!(driver.free_rx(), 2);
    }

    #[test]
    fn mask_and_ring_exhaustion_drop() {
        let driver = LoopbackDriver::new(1, 1, 16);
        driver.set_mask(&DestMask::single(1).unwrap()).unwrap();
        driver.inject(2, 0, 0, b"masked").unwrap();
        assert_eq!(driver.drop_count(), 1);
        driver.inject(1, 0, 0, b"kept").unwrap();
        driver.inject(1, 0, 0, b"no room").unwrap();
        assert_eq!(driver.drop_count(), 2);
        assert!(driver.read(Duration::ZERO).unwrap().is_some());
        assert!(driver.read(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn large_injection_chains_buffers() {
        let driver = LoopbackDriver::new(4, 0, 8);
        driver.inject(0, 2, 1, &[9u8; 20]).unwrap();
        let descs: Vec<RxDescriptor> =
            (0..3).map(|_| driver.read(Duration::ZERO).unwrap().unwrap()).collect();
        assert_eq!(descs.iter().map(|d| d.size).collect::<Vec<_>>(), vec![8, 8, 4]);
        assert_eq!(descs.iter().map(|d| d.cont).collect::<Vec<_>>(), vec![true, true, false]);
        assert_eq!((descs[0].first_user, descs[2].last_user), (2, 1));
    }

    #[test]
    fn registers_default_to_zero() {
        let driver = LoopbackDriver::new(0, 0, 4);
        assert_eq!(driver.read_register(0x100).unwrap(), 0);
        driver.write_register(0x100, 0xDEAD_BEEF).unwrap();
        assert_eq!(driver.read_register(0x100).unwrap(), 0xDEAD_BEEF);
    }
}
