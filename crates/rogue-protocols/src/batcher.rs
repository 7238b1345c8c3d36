//! Batch splitting, inversion and combining.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rogue_core::{
    Error, Result,
    stream::{AsMaster, FramePtr, Master, Slave},
};
use rogue_proto::batcher::{self as wire, RecordTail, SuperHeader, padded};
use tracing::{debug, trace, warn};

/// Breaks a batch into one frame per record.
///
/// Each record becomes a new frame carrying its payload, with the record's
/// destination as channel and its user bytes copied over. A batch that fails
/// to parse is dropped whole.
#[derive(Debug, Default)]
pub struct SplitterV1 {
    master: Master,
    dropped: AtomicU64,
}

impl SplitterV1 {
    /// New splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches dropped as malformed.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AsMaster for SplitterV1 {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for SplitterV1 {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let batch = {
            let lock = frame.lock();
            if lock.error() != 0 {
                debug!(error = lock.error(), "errored batch dropped");
                drop(lock);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            lock.to_vec()
        };
        let (header, records) = match wire::parse(&batch) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = batch.len(), "malformed batch dropped");
                return Ok(());
            },
        };
        trace!(seq = header.seq, records = records.len(), "splitting batch");

        for record in records {
            let data = &batch[record.data];
            let out = self.master.req_frame(data.len(), false)?;
            {
                let mut lock = out.lock();
                lock.write(0, data)?;
                lock.set_channel(record.tail.dest);
                lock.set_first_user(record.tail.first_user);
                lock.set_last_user(record.tail.last_user);
            }
            self.master.send_frame(out);
        }
        Ok(())
    }
}

/// Converts tail-based batches to header-based form in place and forwards
/// the same frame.
#[derive(Debug, Default)]
pub struct InverterV1 {
    master: Master,
    dropped: AtomicU64,
}

impl InverterV1 {
    /// New inverter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches dropped as malformed.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AsMaster for InverterV1 {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for InverterV1 {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        {
            let mut lock = frame.lock();
            let mut batch = lock.to_vec();
            let len = match wire::invert(&mut batch) {
                Ok(len) => len,
                Err(e) => {
                    drop(lock);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "batch not inverted");
                    return Ok(());
                },
            };
            lock.write(0, &batch[..len])?;
            lock.set_payload(len)?;
        }
        self.master.send_frame(frame);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Pending {
    batch: Vec<u8>,
    records: usize,
    seq: u16,
}

/// Packs incoming frames into batches.
///
/// Each frame becomes one record; its channel is the record destination.
/// A batch is sent when the next record would push it past `max_size` or
/// when [`flush`](Self::flush) is called.
#[derive(Debug)]
pub struct CombinerV1 {
    master: Master,
    header: SuperHeader,
    max_size: usize,
    pending: Mutex<Pending>,
}

impl CombinerV1 {
    /// Combiner with 8-byte tails producing batches of at most `max_size`
    /// bytes.
    pub fn new(max_size: usize) -> Result<Self> {
        let header = SuperHeader::default();
        if max_size < header.size() * 2 {
            return Err(Error::Size(max_size));
        }
        Ok(Self { master: Master::new(), header, max_size, pending: Mutex::new(Pending::default()) })
    }

    /// Records waiting in the open batch.
    pub fn pending(&self) -> usize {
        self.pending.lock().records
    }

    /// Send the open batch, if it holds any record.
    pub fn flush(&self) -> Result<()> {
        let batch = Self::take(&mut self.pending.lock());
        match batch {
            Some(batch) => self.send(&batch),
            None => Ok(()),
        }
    }

    /// Close the open batch and hand back its bytes.
    fn take(pending: &mut Pending) -> Option<Vec<u8>> {
        if pending.records == 0 {
            return None;
        }
        pending.seq = pending.seq.wrapping_add(1);
        pending.records = 0;
        Some(std::mem::take(&mut pending.batch))
    }

    fn send(&self, batch: &[u8]) -> Result<()> {
        let frame = self.master.req_frame(batch.len(), false)?;
        frame.lock().write(0, batch)?;
        trace!(len = batch.len(), "batch sent");
        self.master.send_frame(frame);
        Ok(())
    }

    fn append(&self, pending: &mut Pending, data: &[u8], tail: &RecordTail) -> Result<()> {
        let width = self.header.size();
        if pending.records == 0 {
            let header = SuperHeader { seq: pending.seq, ..self.header };
            pending.batch.resize(width, 0);
            header.encode(&mut pending.batch)?;
        }
        let start = pending.batch.len();
        pending.batch.extend_from_slice(data);
        pending.batch.resize(start + padded(data.len(), width) + width, 0);
        let at = pending.batch.len() - width;
        tail.encode(width, &mut pending.batch[at..])?;
        pending.records += 1;
        Ok(())
    }
}

impl AsMaster for CombinerV1 {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for CombinerV1 {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let (data, tail) = {
            let lock = frame.lock();
            let tail = RecordTail {
                size: lock.payload() as u32,
                dest: lock.channel(),
                first_user: lock.first_user(),
                last_user: lock.last_user(),
            };
            (lock.to_vec(), tail)
        };
        let width = self.header.size();
        let record = padded(data.len(), width) + width;
        if record + width > self.max_size || tail.size > wire::MAX_RECORD {
            return Err(Error::Size(data.len()));
        }

        let closed = {
            let mut pending = self.pending.lock();
            let full = pending.batch.len() + record > self.max_size;
            let closed = if full { Self::take(&mut pending) } else { None };
            self.append(&mut pending, &data, &tail)?;
            closed
        };
        match closed {
            Some(batch) => self.send(&batch),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rogue_core::stream::{Pool, connect};

    use super::*;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<(u8, u8, u8, Vec<u8>)>>,
    }

    impl Slave for Collector {
        fn accept_frame(&self, frame: FramePtr) -> Result<()> {
            let lock = frame.lock();
            self.frames.lock().push((lock.channel(), lock.first_user(), lock.last_user(), lock.to_vec()));
            Ok(())
        }
    }

    fn frame(channel: u8, data: &[u8]) -> FramePtr {
        let frame = Pool::new().accept_req(data.len(), false, 0).unwrap();
        {
            let mut lock = frame.lock();
            lock.write(0, data).unwrap();
            lock.set_channel(channel);
            lock.set_first_user(2);
            lock.set_last_user(1);
        }
        frame
    }

    #[test]
    fn combine_then_split() {
        let combiner = CombinerV1::new(4096).unwrap();
        let splitter = Arc::new(SplitterV1::new());
        let sink = Arc::new(Collector::default());
        connect(&combiner, splitter.clone());
        connect(splitter.as_ref(), sink.clone());

        combiner.accept_frame(frame(1, b"abc")).unwrap();
        combiner.accept_frame(frame(7, b"0123456789")).unwrap();
        combiner.accept_frame(frame(3, b"")).unwrap();
        assert_eq!(combiner.pending(), 3);
        combiner.flush().unwrap();
        assert_eq!(combiner.pending(), 0);

        let frames = sink.frames.lock().clone();
        assert_eq!(
            frames,
            vec![
                (1, 2, 1, b"abc".to_vec()),
                (7, 2, 1, b"0123456789".to_vec()),
                (3, 2, 1, Vec::new()),
            ]
        );
    }

    #[test]
    fn combiner_rolls_at_max_size() {
        let combiner = CombinerV1::new(64).unwrap();
        let sink = Arc::new(Collector::default());
        connect(&combiner, sink.clone());

        // header 8 + (16 + 8) per record: two fit, the third opens a new batch
        for i in 0..3u8 {
            combiner.accept_frame(frame(i, &[i; 16])).unwrap();
        }
        assert_eq!(sink.frames.lock().len(), 1);
        assert_eq!(sink.frames.lock()[0].3.len(), 56);
        assert_eq!(combiner.pending(), 1);
        assert!(combiner.accept_frame(frame(0, &[0; 64])).is_err());
    }

    #[test]
    fn concurrent_senders_stay_within_max_size() {
        let combiner = Arc::new(CombinerV1::new(256).unwrap());
        let batches = Arc::new(Collector::default());
        let splitter = Arc::new(SplitterV1::new());
        let records = Arc::new(Collector::default());
        connect(combiner.as_ref(), batches.clone());
        connect(combiner.as_ref(), splitter.clone());
        connect(splitter.as_ref(), records.clone());

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let combiner = &combiner;
                s.spawn(move || {
                    for i in 0..200usize {
                        combiner.accept_frame(frame(t, &vec![t; 1 + (i * 7) % 60])).unwrap();
                    }
                });
            }
        });
        combiner.flush().unwrap();

        assert!(batches.frames.lock().iter().all(|(_, _, _, batch)| batch.len() <= 256));
        assert_eq!(records.frames.lock().len(), 800);
        assert_eq!(splitter.drop_count(), 0);
    }

    #[test]
    fn splitter_drops_malformed_batch() {
        let splitter = SplitterV1::new();
        let sink = Arc::new(Collector::default());
        connect(&splitter, sink.clone());

        splitter.accept_frame(frame(0, &[0x05, 0, 0, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(splitter.drop_count(), 1);
        assert!(sink.frames.lock().is_empty());
    }

    #[test]
    fn inverter_moves_tails_forward() {
        let combiner = CombinerV1::new(4096).unwrap();
        let inverter = Arc::new(InverterV1::new());
        let sink = Arc::new(Collector::default());
        connect(&combiner, inverter.clone());
        connect(inverter.as_ref(), sink.clone());

        combiner.accept_frame(frame(4, b"abcdefgh")).unwrap();
        combiner.accept_frame(frame(5, b"xy")).unwrap();
        combiner.flush().unwrap();

        let frames = sink.frames.lock().clone();
        let inverted = &frames[0].3;
        assert_eq!(inverted.len(), 32);
        let first = RecordTail::decode(&inverted[0..8]).unwrap();
        assert_eq!((first.size, first.dest), (8, 4));
        assert_eq!(&inverted[8..16], b"abcdefgh");
        let second = RecordTail::decode(&inverted[16..24]).unwrap();
        assert_eq!((second.size, second.dest), (2, 5));
        assert_eq!(&inverted[24..26], b"xy");
    }
}
