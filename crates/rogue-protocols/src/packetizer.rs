//! Frame fragmentation and reassembly.
//!
//! The packetizer cuts application frames into segments that fit the
//! transport's buffer size and stitches them back together on the far side.
//! Up to 256 applications share one transport; each is addressed by the
//! `dest` byte of the segment header and attached through
//! [`Packetizer::application`].
//!
//! # Outbound
//!
//! Every application frame becomes one or more segments requested from the
//! transport master. Segments are queued and a worker thread feeds them to
//! the transport, so a slow transport back-pressures the application through
//! the queue depth.
//!
//! # Inbound
//!
//! Segments are validated against the per-destination reassembly state.
//! Payload buffers are moved, not copied, into the frame being rebuilt. A
//! sequence gap, CRC mismatch, interrupted frame or reassembly timeout drops
//! the whole frame and counts one drop; remaining segments of that frame are
//! discarded silently until the next start of frame.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use rogue_core::{
    BoundedQueue, Error, Result,
    stream::{AsMaster, Buffer, Frame, FramePtr, Master, Slave},
};
use rogue_proto::{
    RunningCrc,
    packetizer::{self as wire, CRC_DATA, CRC_NONE, SegmentMeta, Version},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Packetizer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketizerConfig {
    /// Wire version, 1 or 2
    pub version: u8,
    /// Check the CRC of inbound frames (v2)
    pub en_ib_crc: bool,
    /// Generate a CRC for outbound frames (v2)
    pub en_ob_crc: bool,
    /// Transport buffer size; segments are sized to fit it
    pub max_buffer: usize,
    /// Reassembly timeout per destination; zero disables it
    pub timeout: Duration,
    /// Depth of the outbound segment queue
    pub queue_depth: usize,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            version: 2,
            en_ib_crc: true,
            en_ob_crc: true,
            max_buffer: 1400,
            timeout: Duration::from_secs(1),
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Default)]
struct Reassembly {
    frame: Option<FramePtr>,
    next_seq: u16,
    tid: u8,
    crc: RunningCrc,
    started: Option<Instant>,
    discarding: bool,
}

#[derive(Debug)]
struct Shared {
    version: Version,
    config: PacketizerConfig,
    segment_size: usize,
    transport: Master,
    queue: BoundedQueue<FramePtr>,
    apps: RwLock<HashMap<u8, Arc<Application>>>,
    rx: Mutex<HashMap<u8, Reassembly>>,
    tid: Mutex<u8>,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl Shared {
    fn send(&self, dest: u8, frame: &FramePtr) -> Result<()> {
        // Held for the whole frame so segments of two frames never interleave
        let mut next_tid = self.tid.lock();
        let tid = *next_tid;
        *next_tid = tid.wrapping_add(1);

        let src = frame.lock();
        let total = src.payload();
        let count = total.div_ceil(self.segment_size).max(1);
        let crc_mode = if self.version == Version::V2 && self.config.en_ob_crc {
            CRC_DATA
        } else {
            CRC_NONE
        };

        let mut crc = RunningCrc::new();
        let mut chunk = vec![0u8; self.segment_size.min(total)];
        for index in 0..count {
            let offset = index * self.segment_size;
            let len = (total - offset).min(self.segment_size);
            let data = &mut chunk[..len];
            src.read(offset, data)?;
            crc.update(data);

            let meta = SegmentMeta {
                dest,
                seq: index as u16,
                tdest: src.channel(),
                tid,
                sof: index == 0,
                last: index + 1 == count,
                first_user: src.first_user(),
                last_user: src.last_user(),
                crc_mode,
                crc: if crc_mode == CRC_DATA { crc.value() } else { 0 },
            };
            let segment = self.build_segment(&meta, data)?;
            self.queue.push(segment)?;
        }
        trace!(dest, tid, total, segments = count, "frame segmented");
        Ok(())
    }

    fn build_segment(&self, meta: &SegmentMeta, data: &[u8]) -> Result<FramePtr> {
        let (head, tail) = (self.version.header_size(), self.version.tail_size());
        let segment = self.transport.req_frame(head + data.len() + tail, false)?;
        let mut lock = segment.lock();

        let mut bytes = [0u8; 8];
        wire::encode_header(self.version, meta, &mut bytes)?;
        lock.write(0, &bytes[..head])?;
        lock.write(head, data)?;
        if tail > 0 {
            wire::encode_tail(self.version, data.len(), meta, &mut bytes)?;
            lock.write(head + data.len(), &bytes[..tail])?;
        }
        drop(lock);
        Ok(segment)
    }

    fn receive(&self, segment: &FramePtr, now: Instant) -> Result<()> {
        let (head, tail) = (self.version.header_size(), self.version.tail_size());
        let mut lock = segment.lock();
        let total = lock.payload();
        if total < head + tail {
            self.count_drop(None, "short segment");
            return Ok(());
        }

        let mut header = [0u8; 8];
        let mut trailer = [0u8; 8];
        lock.read(0, &mut header[..head])?;
        lock.read(total - tail, &mut trailer[..tail])?;
        let (meta, size) = match wire::decode_parts(
            self.version,
            &header[..head],
            &trailer[..tail],
            total - head - tail,
        ) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "malformed packetizer segment");
                self.count_drop(None, "malformed segment");
                return Ok(());
            },
        };

        lock.strip_header(head)?;
        lock.set_payload(size)?;
        let buffers = lock.take_buffers();
        drop(lock);

        let complete = {
            let mut rx = self.rx.lock();
            let slot = rx.entry(meta.dest).or_default();
            self.reassemble(slot, &meta, buffers, now)
        };
        if let Some(frame) = complete {
            self.deliver(meta.dest, frame);
        }
        Ok(())
    }

    fn reassemble(
        &self,
        slot: &mut Reassembly,
        meta: &SegmentMeta,
        buffers: Vec<Buffer>,
        now: Instant,
    ) -> Option<FramePtr> {
        if meta.sof {
            if slot.frame.take().is_some() {
                self.count_drop(Some(meta.dest), "frame interrupted by new start");
            }
            let frame = Frame::new();
            {
                let mut lock = frame.lock();
                lock.set_channel(meta.tdest);
                lock.set_first_user(meta.first_user);
            }
            *slot = Reassembly {
                frame: Some(frame),
                next_seq: 0,
                tid: meta.tid,
                crc: RunningCrc::new(),
                started: Some(now),
                discarding: false,
            };
        }

        let Some(frame) = slot.frame.clone() else {
            if !slot.discarding {
                self.count_drop(Some(meta.dest), "segment without frame start");
            }
            slot.discarding = !meta.last;
            return None;
        };

        if meta.seq != slot.next_seq || meta.tid != slot.tid {
            debug!(
                dest = meta.dest,
                expected = slot.next_seq,
                got = meta.seq,
                tid = meta.tid,
                "packetizer sequence mismatch"
            );
            self.count_drop(Some(meta.dest), "sequence mismatch");
            slot.frame = None;
            slot.started = None;
            slot.discarding = !meta.last;
            return None;
        }
        slot.next_seq = slot.next_seq.wrapping_add(1);

        let check = self.version == Version::V2 && self.config.en_ib_crc && meta.crc_mode == CRC_DATA;
        if check {
            for buffer in &buffers {
                slot.crc.update(buffer.data());
            }
        }
        {
            let mut lock = frame.lock();
            for buffer in buffers.into_iter().filter(|b| b.payload() > 0) {
                lock.append_buffer(buffer);
            }
        }

        if !meta.last {
            return None;
        }
        slot.frame = None;
        slot.started = None;
        if check && slot.crc.value() != meta.crc {
            self.count_drop(Some(meta.dest), "crc mismatch");
            return None;
        }
        if self.version == Version::V2 {
            frame.lock().set_last_user(meta.last_user);
        }
        Some(frame)
    }

    fn deliver(&self, dest: u8, frame: FramePtr) {
        let app = self.apps.read().get(&dest).cloned();
        match app {
            Some(app) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                app.master.send_frame(frame);
            },
            None => self.count_drop(Some(dest), "no application at destination"),
        }
    }

    fn expire(&self, now: Instant) {
        let timeout = self.config.timeout;
        if timeout.is_zero() {
            return;
        }
        let mut rx = self.rx.lock();
        for (dest, slot) in &mut *rx {
            let Some(started) = slot.started else { continue };
            if now.saturating_duration_since(started) >= timeout {
                slot.frame = None;
                slot.started = None;
                slot.discarding = true;
                self.count_drop(Some(*dest), "reassembly timeout");
            }
        }
    }

    fn count_drop(&self, dest: Option<u8>, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(?dest, reason, "packetizer dropped frame");
    }
}

/// Fragmenting and reassembling bridge between applications and a transport.
///
/// The packetizer itself is the transport-side node: attach it as a slave of
/// the transport's master and attach the transport as a slave of it.
#[derive(Debug)]
pub struct Packetizer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Packetizer {
    /// Start a packetizer and its transmit worker.
    pub fn new(config: PacketizerConfig) -> Result<Arc<Self>> {
        let version = match config.version {
            1 => Version::V1,
            2 => Version::V2,
            _ => return Err(Error::Unsupported("packetizer version")),
        };
        let segment_size = version.segment_size(config.max_buffer);
        if segment_size == 0 {
            return Err(Error::Size(config.max_buffer));
        }

        let shared = Arc::new(Shared {
            version,
            segment_size,
            transport: Master::new(),
            queue: BoundedQueue::new(config.queue_depth, 0),
            apps: RwLock::new(HashMap::new()),
            rx: Mutex::new(HashMap::new()),
            tid: Mutex::new(0),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            config,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let tick = if shared.config.timeout.is_zero() {
                Duration::from_millis(100)
            } else {
                (shared.config.timeout / 2).max(Duration::from_millis(1))
            };
            thread::Builder::new().name("rogue-packetizer".into()).spawn(move || {
                let mut last_check = Instant::now();
                loop {
                    match shared.queue.try_pop_for(tick) {
                        Ok(Some(segment)) => shared.transport.send_frame(segment),
                        Ok(None) => {},
                        Err(_) => break,
                    }
                    let now = Instant::now();
                    if now.duration_since(last_check) >= tick {
                        shared.expire(now);
                        last_check = now;
                    }
                }
                debug!("packetizer worker exiting");
            })?
        };

        debug!(version = ?version, segment_size, "packetizer started");
        Ok(Arc::new(Self { shared, worker: Mutex::new(Some(worker)) }))
    }

    /// Application endpoint for `dest`, created on first use.
    pub fn application(&self, dest: u8) -> Arc<Application> {
        let mut apps = self.shared.apps.write();
        let app = apps.entry(dest).or_insert_with(|| {
            Arc::new(Application {
                dest,
                master: Master::new(),
                core: Arc::downgrade(&self.shared),
            })
        });
        Arc::clone(app)
    }

    /// Payload bytes per segment.
    pub fn segment_size(&self) -> usize {
        self.shared.segment_size
    }

    /// Frames dropped on the inbound side.
    pub fn drop_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Frames reassembled and delivered.
    pub fn frame_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Stop the worker and discard queued segments.
    pub fn stop(&self) {
        self.shared.queue.stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Packetizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AsMaster for Packetizer {
    fn master(&self) -> &Master {
        &self.shared.transport
    }
}

impl Slave for Packetizer {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        self.shared.receive(&frame, Instant::now())
    }
}

/// One application destination of a [`Packetizer`].
///
/// Frames sent to it are segmented toward the transport; reassembled frames
/// for its destination leave through its master.
#[derive(Debug)]
pub struct Application {
    dest: u8,
    master: Master,
    core: Weak<Shared>,
}

impl Application {
    /// Destination byte.
    pub fn dest(&self) -> u8 {
        self.dest
    }
}

impl AsMaster for Application {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for Application {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let core = self.core.upgrade().ok_or(Error::Stopped)?;
        core.send(self.dest, &frame)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Condvar;
    use proptest::prelude::*;
    use rogue_core::stream::{Pool, connect};

    use super::*;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<(u8, Vec<u8>)>>,
        cv: Condvar,
    }

    impl Collector {
        fn wait(&self, count: usize) -> Vec<(u8, Vec<u8>)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut frames = self.frames.lock();
            while frames.len() < count {
                if self.cv.wait_until(&mut frames, deadline).timed_out() {
                    break;
                }
            }
            frames.clone()
        }
    }

    impl Slave for Collector {
        fn accept_frame(&self, frame: FramePtr) -> Result<()> {
            let lock = frame.lock();
            self.frames.lock().push((lock.channel(), lock.to_vec()));
            self.cv.notify_all();
            Ok(())
        }
    }

    /// Forwards segments, flipping a byte in the nth one and dropping the
    /// mth one.
    struct Tamper {
        out: Master,
        seen: Mutex<usize>,
        corrupt: Option<usize>,
        lose: Option<usize>,
    }

    impl Slave for Tamper {
        fn accept_frame(&self, frame: FramePtr) -> Result<()> {
            let index = {
                let mut seen = self.seen.lock();
                *seen += 1;
                *seen
            };
            if self.lose == Some(index) {
                return Ok(());
            }
            if self.corrupt == Some(index) {
                let mut lock = frame.lock();
                let mut byte = [0u8];
                lock.read(12, &mut byte)?;
                lock.write(12, &[byte[0] ^ 0xFF])?;
            }
            self.out.send_frame(frame);
            Ok(())
        }
    }

    fn config(version: u8, max_buffer: usize) -> PacketizerConfig {
        PacketizerConfig { version, max_buffer, ..PacketizerConfig::default() }
    }

    fn app_frame(data: &[u8], channel: u8) -> FramePtr {
        let frame = Pool::new().accept_req(data.len(), false, 0).unwrap();
        {
            let mut lock = frame.lock();
            lock.write(0, data).unwrap();
            lock.set_channel(channel);
        }
        frame
    }

    fn pair(
        config: &PacketizerConfig,
        corrupt: Option<usize>,
        lose: Option<usize>,
    ) -> (Arc<Packetizer>, Arc<Packetizer>) {
        let tx = Packetizer::new(config.clone()).unwrap();
        let rx = Packetizer::new(config.clone()).unwrap();
        let tamper = Arc::new(Tamper { out: Master::new(), seen: Mutex::new(0), corrupt, lose });
        tamper.out.add_slave(rx.clone());
        tx.master().add_slave(tamper);
        (tx, rx)
    }

    #[test]
    fn v2_round_trip_preserves_bytes_and_channel() {
        let (tx, rx) = pair(&config(2, 144), None, None);
        assert_eq!(tx.segment_size(), 128);
        let sink = Arc::new(Collector::default());
        connect(rx.application(3).as_ref(), sink.clone());

        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        tx.application(3).accept_frame(app_frame(&data, 9)).unwrap();

        let frames = sink.wait(1);
        assert_eq!(frames, vec![(9, data)]);
        assert_eq!(rx.drop_count(), 0);
        assert_eq!(rx.frame_count(), 1);
    }

    #[test]
    fn v1_round_trip() {
        let (tx, rx) = pair(&config(1, 64), None, None);
        let sink = Arc::new(Collector::default());
        connect(rx.application(0).as_ref(), sink.clone());

        tx.application(0).accept_frame(app_frame(b"", 1)).unwrap();
        tx.application(0).accept_frame(app_frame(&[0x55; 200], 2)).unwrap();

        let frames = sink.wait(2);
        assert_eq!(frames[0], (1, Vec::new()));
        assert_eq!(frames[1], (2, vec![0x55; 200]));
    }

    #[test]
    fn corrupted_segment_drops_whole_frame() {
        let (tx, rx) = pair(&config(2, 144), Some(3), None);
        let sink = Arc::new(Collector::default());
        connect(rx.application(0).as_ref(), sink.clone());

        let app = tx.application(0);
        app.accept_frame(app_frame(&[0xA5; 1000], 0)).unwrap();
        app.accept_frame(app_frame(b"after", 0)).unwrap();

        let frames = sink.wait(1);
        assert_eq!(frames, vec![(0, b"after".to_vec())]);
        assert_eq!(rx.drop_count(), 1);
    }

    #[test]
    fn lost_segment_counts_one_drop() {
        let (tx, rx) = pair(&config(2, 144), None, Some(2));
        let sink = Arc::new(Collector::default());
        connect(rx.application(0).as_ref(), sink.clone());

        let app = tx.application(0);
        app.accept_frame(app_frame(&[1; 600], 0)).unwrap();
        app.accept_frame(app_frame(&[2; 10], 0)).unwrap();

        let frames = sink.wait(1);
        assert_eq!(frames, vec![(0, vec![2; 10])]);
        assert_eq!(rx.drop_count(), 1);
    }

    #[test]
    fn destinations_are_independent() {
        let (tx, rx) = pair(&config(2, 144), None, None);
        let (a, b) = (Arc::new(Collector::default()), Arc::new(Collector::default()));
        connect(rx.application(1).as_ref(), a.clone());
        connect(rx.application(2).as_ref(), b.clone());

        tx.application(2).accept_frame(app_frame(b"two", 0)).unwrap();
        tx.application(1).accept_frame(app_frame(b"one", 0)).unwrap();

        assert_eq!(a.wait(1), vec![(0, b"one".to_vec())]);
        assert_eq!(b.wait(1), vec![(0, b"two".to_vec())]);
    }

    #[test]
    fn reassembly_times_out() {
        let cfg = PacketizerConfig { timeout: Duration::from_secs(10), ..config(2, 144) };
        let rx = Packetizer::new(cfg).unwrap();

        let meta = SegmentMeta { dest: 4, sof: true, crc_mode: CRC_NONE, ..SegmentMeta::default() };
        let segment = rx.shared.build_segment(&meta, b"partial").unwrap();
        let now = Instant::now();
        rx.shared.receive(&segment, now).unwrap();
        assert_eq!(rx.drop_count(), 0);

        rx.shared.expire(now + Duration::from_secs(1));
        assert_eq!(rx.drop_count(), 0);
        rx.shared.expire(now + Duration::from_secs(11));
        assert_eq!(rx.drop_count(), 1);
    }

    #[test]
    fn rejects_unusable_configs() {
        assert!(matches!(Packetizer::new(config(3, 1400)), Err(Error::Unsupported(_))));
        assert!(matches!(Packetizer::new(config(2, 16)), Err(Error::Size(16))));
    }

    #[test]
    fn config_round_trips_through_cbor() {
        let cfg = PacketizerConfig { version: 1, timeout: Duration::from_millis(250), ..Default::default() };
        let mut bytes = Vec::new();
        ciborium::into_writer(&cfg, &mut bytes).unwrap();
        let back: PacketizerConfig = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, cfg);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn fragmentation_is_inverted(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            version in 1u8..=2,
            channel in any::<u8>(),
        ) {
            let (tx, rx) = pair(&config(version, 96), None, None);
            let sink = Arc::new(Collector::default());
            connect(rx.application(7).as_ref(), sink.clone());
            tx.application(7).accept_frame(app_frame(&data, channel)).unwrap();
            let frames = sink.wait(1);
            prop_assert_eq!(frames, vec![(channel, data)]);
        }
    }
}
