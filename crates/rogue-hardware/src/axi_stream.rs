//! Zero-copy stream endpoint for one DMA destination.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use rogue_core::{
    Error, Result,
    stream::{
        AsMaster, Buffer, BufferSource, Frame, FramePtr, Master, Pool, Region, Slave,
        buffer::{META_ID_MASK, META_STALE, META_ZERO_COPY},
        frame::SSI_SOF,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::{
    dev::{DevDriver, DriverOps},
    driver::{DestMask, DmaDriver, TxDescriptor},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Meta tag: driver buffer acquired for transmission.
const META_TX: u32 = 0x0100_0000;

/// Frame error set when the device flags a receive error.
pub const ERROR_DMA: u8 = 0x80;

/// Endpoint settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxiStreamConfig {
    /// DMA destination this endpoint sends to and receives from
    pub dest: u32,
    /// Translate SSI start/end-of-frame user bits
    pub ssi: bool,
    /// How long a zero-copy request waits for a transmit buffer
    pub tx_timeout: Duration,
}

impl Default for AxiStreamConfig {
    fn default() -> Self {
        Self { dest: 0, ssi: true, tx_timeout: Duration::from_secs(1) }
    }
}

#[derive(Debug)]
struct Shared {
    driver: Arc<dyn DmaDriver>,
    config: AxiStreamConfig,
    master: Master,
    pool: Pool,
    stop: AtomicBool,
    rx_frames: AtomicU64,
    rx_errors: AtomicU64,
    tx_frames: AtomicU64,
}

impl BufferSource for Shared {
    fn ret_buffer(&self, region: Box<dyn Region>, meta: u32, _raw_size: usize) {
        let index = meta & META_ID_MASK;
        self.driver.put_region(index, region);
        if meta & META_STALE == 0 {
            if let Err(e) = self.driver.ret_index(index) {
                error!(index, error = %e, "dma buffer not returned");
            }
        }
    }
}

impl Shared {
    fn buffer(self: &Arc<Self>, index: u32, tag: u32) -> Result<Buffer> {
        let region = match self.driver.take_region(index) {
            Ok(region) => region,
            Err(e) => {
                let _ = self.driver.ret_index(index);
                return Err(e);
            },
        };
        let source: Arc<dyn BufferSource> = self.clone();
        Ok(Buffer::new(source, region, META_ZERO_COPY | tag | index, self.driver.buffer_size()))
    }

    fn run(self: &Arc<Self>) {
        let mut pending: Option<FramePtr> = None;
        while !self.stop.load(Ordering::Acquire) {
            let desc = match self.driver.read(POLL_INTERVAL) {
                Ok(Some(desc)) => desc,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "dma read failed");
                    thread::sleep(POLL_INTERVAL);
                    continue;
                },
            };
            let mut buffer = match self.buffer(desc.index, 0) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!(index = desc.index, error = %e, "dma buffer unavailable");
                    continue;
                },
            };
            if let Err(e) = buffer.set_payload(desc.size) {
                warn!(index = desc.index, error = %e, "dma descriptor oversized");
                pending = None;
                continue;
            }

            let frame = pending.get_or_insert_with(|| {
                let frame = Frame::new();
                {
                    let mut lock = frame.lock();
                    lock.set_channel(desc.dest as u8);
                    lock.set_first_user(desc.first_user);
                }
                frame
            });
            {
                let mut lock = frame.lock();
                lock.append_buffer(buffer);
                if desc.error != 0 {
                    lock.set_error(ERROR_DMA);
                }
                if !desc.cont {
                    lock.set_last_user(desc.last_user);
                    if self.config.ssi && lock.eofe() {
                        lock.set_error(lock.error() | ERROR_DMA);
                    }
                }
            }
            if desc.cont {
                continue;
            }
            let Some(frame) = pending.take() else { continue };
            if frame.lock().error() != 0 {
                self.rx_errors.fetch_add(1, Ordering::Relaxed);
            }
            self.rx_frames.fetch_add(1, Ordering::Relaxed);
            trace!(dest = desc.dest, "dma frame received");
            self.master.send_frame(frame);
        }
        debug!(dest = self.config.dest, "dma receive thread exiting");
    }

    fn req(self: &Arc<Self>, size: usize, zero_copy_ok: bool) -> Result<FramePtr> {
        if !zero_copy_ok {
            return self.pool.accept_req(size, false, 0);
        }
        let buffer_size = self.driver.buffer_size();
        let count = size.div_ceil(buffer_size).max(1);
        let frame = Frame::new();
        {
            let mut lock = frame.lock();
            for _ in 0..count {
                let index = self
                    .driver
                    .tx_index(self.config.tx_timeout)?
                    .ok_or(Error::Timeout(self.config.tx_timeout))?;
                lock.append_buffer(self.buffer(index, META_TX)?);
            }
        }
        Ok(frame)
    }

    /// Whether `buffer` is one of this endpoint's transmit buffers.
    fn is_zero_copy(&self, buffer: &Buffer) -> bool {
        buffer.meta() & (META_ZERO_COPY | META_TX) == META_ZERO_COPY | META_TX
            && buffer.is_from(self)
    }

    fn send(self: &Arc<Self>, frame: &FramePtr) -> Result<()> {
        let mut lock = frame.lock();
        if lock.payload() == 0 {
            debug!("empty frame not sent");
            return Ok(());
        }
        let direct = lock.buffers().iter().all(|b| self.is_zero_copy(b));
        if !direct {
            let copy = self.req(lock.payload(), true)?;
            {
                let mut out = copy.lock();
                out.copy_payload_from(&lock, 0, lock.payload())?;
                out.copy_meta(&lock);
            }
            drop(lock);
            return self.send(&copy);
        }

        let mut first_user = lock.first_user();
        if self.config.ssi {
            first_user |= SSI_SOF;
        }
        let last_user = lock.last_user();
        let buffers: Vec<Buffer> =
            lock.take_buffers().into_iter().filter(|b| b.payload() > 0).collect();
        drop(lock);

        let last = buffers.len() - 1;
        for (i, mut buffer) in buffers.into_iter().enumerate() {
            let size = align_to_front(&mut buffer)?;
            let index = buffer.meta() & META_ID_MASK;
            buffer.set_meta(buffer.meta() | META_STALE);
            drop(buffer);
            let desc = TxDescriptor {
                index,
                size,
                dest: self.config.dest,
                first_user: if i == 0 { first_user } else { 0 },
                last_user: if i == last { last_user } else { 0 },
                cont: i < last,
            };
            if let Err(e) = self.driver.write(&desc) {
                error!(index, error = %e, "dma write failed");
                return Err(e);
            }
        }
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        trace!(dest = self.config.dest, "dma frame sent");
        Ok(())
    }
}

/// Move a buffer's payload to the start of its region, where the device
/// reads from. Returns the payload size.
fn align_to_front(buffer: &mut Buffer) -> Result<usize> {
    let size = buffer.payload();
    let head_room = buffer.head_room();
    if head_room > 0 {
        buffer.adjust_header(-(head_room as isize))?;
        buffer.data_mut().copy_within(head_room..head_room + size, 0);
        buffer.set_payload(size)?;
    }
    Ok(size)
}

/// Stream endpoint bound to one DMA destination.
///
/// Received frames are built directly on driver buffers and forwarded
/// without copying; the buffers go back to the driver when the frames drop.
/// Frame requests with `zero_copy_ok` hand out driver transmit buffers, and
/// frames built on them are sent without copying. Any other frame is copied
/// into transmit buffers first.
#[derive(Debug)]
pub struct AxiStream {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AxiStream {
    /// Endpoint over an open driver.
    pub fn new(driver: Arc<dyn DmaDriver>, config: AxiStreamConfig) -> Result<Arc<Self>> {
        driver.set_mask(&DestMask::single(config.dest)?)?;
        let shared = Arc::new(Shared {
            driver,
            config,
            master: Master::new(),
            pool: Pool::new(),
            stop: AtomicBool::new(false),
            rx_frames: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("rogue-dma".into()).spawn(move || shared.run())?
        };
        info!(dest = config.dest, "dma stream started");
        Ok(Arc::new(Self { shared, worker: Mutex::new(Some(worker)) }))
    }

    /// Endpoint over the device node at `path` with default request codes.
    pub fn open(path: &str, dest: u32) -> Result<Arc<Self>> {
        let driver = DevDriver::open(path, DriverOps::default())?;
        Self::new(Arc::new(driver), AxiStreamConfig { dest, ..AxiStreamConfig::default() })
    }

    /// Destination served.
    pub fn dest(&self) -> u32 {
        self.shared.config.dest
    }

    /// Underlying driver.
    pub fn driver(&self) -> &Arc<dyn DmaDriver> {
        &self.shared.driver
    }

    /// Frames received.
    pub fn rx_count(&self) -> u64 {
        self.shared.rx_frames.load(Ordering::Relaxed)
    }

    /// Received frames carrying an error.
    pub fn rx_error_count(&self) -> u64 {
        self.shared.rx_errors.load(Ordering::Relaxed)
    }

    /// Frames sent.
    pub fn tx_count(&self) -> u64 {
        self.shared.tx_frames.load(Ordering::Relaxed)
    }

    /// Stop the receive thread.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl AsMaster for AxiStream {
    fn master(&self) -> &Master {
        &self.shared.master
    }
}

impl Slave for AxiStream {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        self.shared.send(&frame)
    }

    fn accept_req(&self, size: usize, zero_copy_ok: bool) -> Result<FramePtr> {
        self.shared.req(size, zero_copy_ok)
    }
}

impl Drop for AxiStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rogue_core::stream::connect;

    use super::*;
    use crate::LoopbackDriver;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<FramePtr>>,
    }

    impl Collector {
        fn wait_for(&self, count: usize) -> Vec<FramePtr> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.frames.lock().len() < count && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            self.frames.lock().clone()
        }
    }

    impl Slave for Collector {
        fn accept_frame(&self, frame: FramePtr) -> Result<()> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn endpoint(driver: &Arc<LoopbackDriver>, dest: u32) -> Arc<AxiStream> {
        let driver: Arc<dyn DmaDriver> = driver.clone();
        AxiStream::new(driver, AxiStreamConfig { dest, ssi: false, ..AxiStreamConfig::default() })
            .unwrap()
    }

    #[test]
    fn zero_copy_request_uses_driver_buffers() {
        let driver = Arc::new(LoopbackDriver::new(4, 4, 256));
        let axi = endpoint(&driver, 3);
        let frame = axi.accept_req(600, true).unwrap();
        {
            let lock = frame.lock();
            assert_eq!(lock.buffer_count(), 3);
            assert!(lock.buffers().iter().all(|b| b.meta() & META_ZERO_COPY != 0));
            assert!(lock.buffers().iter().all(|b| driver.maps(b.as_ptr())));
            let mut starts: Vec<*const u8> = lock.buffers().iter().map(|b| b.as_ptr()).collect();
            starts.sort();
            starts.dedup();
            assert_eq!(starts.len(), 3);
        }
        let heap = Pool::new().accept_req(16, false, 0).unwrap();
        assert!(!driver.maps(heap.lock().buffers()[0].as_ptr()));
        assert_eq!(driver.free_tx(), 1);
        drop(frame);
        assert_eq!(driver.free_tx(), 4);
    }

    #[test]
    fn sent_frame_loops_back_without_copy() {
        let driver = Arc::new(LoopbackDriver::new(8, 4, 128));
        let axi = endpoint(&driver, 2);
        let sink = Arc::new(Collector::default());
        connect(axi.as_ref(), sink.clone());

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let frame = axi.accept_req(data.len(), true).unwrap();
        {
            let mut lock = frame.lock();
            lock.write(0, &data).unwrap();
            lock.set_first_user(0x10);
            lock.set_last_user(0x04);
        }
        axi.accept_frame(frame).unwrap();
        assert_eq!(axi.tx_count(), 1);
        assert_eq!(driver.free_tx(), 4);

        let got = sink.wait_for(1);
        let lock = got[0].lock();
        assert_eq!(lock.to_vec(), data);
        assert_eq!(lock.buffer_count(), 2);
        assert!(lock.buffers().iter().all(|b| driver.maps(b.as_ptr())));
        assert_eq!((lock.channel(), lock.first_user(), lock.last_user()), (2, 0x10, 0x04));
        drop(lock);
        drop(got);
        sink.frames.lock().clear();
        assert_eq!(driver.free_rx(), 8);
    }

    #[test]
    fn heap_frames_are_copied_into_transmit_buffers() {
        let driver = Arc::new(LoopbackDriver::new(4, 2, 64));
        let axi = endpoint(&driver, 0);
        let sink = Arc::new(Collector::default());
        connect(axi.as_ref(), sink.clone());

        let frame = Pool::new().accept_req(10, false, 0).unwrap();
        frame.lock().write(0, b"0123456789").unwrap();
        axi.accept_frame(frame).unwrap();
        let got = sink.wait_for(1);
        assert_eq!(got[0].lock().to_vec(), b"0123456789");
    }

    #[test]
    fn stripped_header_is_moved_to_buffer_start() {
        let driver = Arc::new(LoopbackDriver::new(4, 2, 64));
        let axi = endpoint(&driver, 0);
        let sink = Arc::new(Collector::default());
        connect(axi.as_ref(), sink.clone());

        let frame = axi.accept_req(12, true).unwrap();
        {
            let mut lock = frame.lock();
            lock.write(0, b"HDR:payload!").unwrap();
            lock.strip_header(4).unwrap();
        }
        axi.accept_frame(frame).unwrap();
        assert_eq!(sink.wait_for(1)[0].lock().to_vec(), b"payload!");
    }

    #[test]
    fn device_errors_and_ssi_eofe_mark_frames() {
        let driver = Arc::new(LoopbackDriver::new(4, 2, 64));
        let dyn_driver: Arc<dyn DmaDriver> = driver.clone();
        let axi = AxiStream::new(dyn_driver, AxiStreamConfig { dest: 1, ..AxiStreamConfig::default() })
            .unwrap();
        let sink = Arc::new(Collector::default());
        connect(axi.as_ref(), sink.clone());

        driver.inject(1, 0x02, 0x01, b"bad tail").unwrap();
        driver.inject(1, 0x02, 0x00, b"good").unwrap();
        let got = sink.wait_for(2);
        assert_eq!(got[0].lock().error(), ERROR_DMA);
        assert_eq!(got[1].lock().error(), 0);
        assert_eq!(axi.rx_error_count(), 1);
    }

    #[test]
    fn exhausted_transmit_ring_times_out() {
        let driver = Arc::new(LoopbackDriver::new(1, 1, 16));
        let dyn_driver: Arc<dyn DmaDriver> = driver.clone();
        let config = AxiStreamConfig {
            dest: 0,
            ssi: false,
            tx_timeout: Duration::from_millis(10),
        };
        let axi = AxiStream::new(dyn_driver, config).unwrap();
        let held = axi.accept_req(16, true).unwrap();
        assert!(matches!(axi.accept_req(16, true), Err(Error::Timeout(_))));
        drop(held);
        assert!(axi.accept_req(16, true).is_ok());
    }
}
