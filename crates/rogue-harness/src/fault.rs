//! Fault-injecting stream nodes.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rogue_core::{
    Result,
    stream::{AsMaster, FramePtr, Master, Slave},
};
use tracing::trace;

/// Seeded coin deciding which packets a faulty link loses.
#[derive(Debug, Clone)]
pub struct LossModel {
    rng: ChaCha8Rng,
    rate: f64,
}

impl LossModel {
    /// Lose each packet with probability `rate` (clamped to `0.0..=1.0`).
    pub fn new(seed: u64, rate: f64) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed), rate: rate.clamp(0.0, 1.0) }
    }

    /// Loss probability.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Change the loss probability; 1.0 partitions the link.
    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate.clamp(0.0, 1.0);
    }

    /// Whether the next packet is lost.
    pub fn lose(&mut self) -> bool {
        self.rng.gen_bool(self.rate)
    }

    /// Uniform draw from `range`, for workloads that share the seed.
    pub fn gen_range(&mut self, range: std::ops::RangeInclusive<usize>) -> usize {
        self.rng.gen_range(range)
    }
}

/// Pass-through that drops frames at random.
#[derive(Debug)]
pub struct LossyLink {
    master: Master,
    model: Mutex<LossModel>,
    passed: AtomicU64,
    lost: AtomicU64,
}

impl LossyLink {
    /// Link losing frames with probability `rate`.
    pub fn new(seed: u64, rate: f64) -> Self {
        Self {
            master: Master::new(),
            model: Mutex::new(LossModel::new(seed, rate)),
            passed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    /// Change the loss probability.
    pub fn set_rate(&self, rate: f64) {
        self.model.lock().set_rate(rate);
    }

    /// Frames forwarded.
    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    /// Frames dropped.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl AsMaster for LossyLink {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for LossyLink {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        if self.model.lock().lose() {
            self.lost.fetch_add(1, Ordering::Relaxed);
            trace!("frame lost");
            return Ok(());
        }
        self.passed.fetch_add(1, Ordering::Relaxed);
        self.master.send_frame(frame);
        Ok(())
    }
}

/// Pass-through that inverts one byte of the `index`-th frame.
#[derive(Debug)]
pub struct Corrupter {
    master: Master,
    index: u64,
    offset: usize,
    seen: AtomicU64,
}

impl Corrupter {
    /// Corrupt byte `offset` of frame number `index` (zero-based).
    pub fn new(index: u64, offset: usize) -> Self {
        Self { master: Master::new(), index, offset, seen: AtomicU64::new(0) }
    }

    /// Frames that passed through.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl AsMaster for Corrupter {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for Corrupter {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        if self.seen.fetch_add(1, Ordering::Relaxed) == self.index {
            let mut lock = frame.lock();
            let mut byte = [0u8; 1];
            lock.read(self.offset, &mut byte)?;
            lock.write(self.offset, &[!byte[0]])?;
            trace!(index = self.index, offset = self.offset, "frame corrupted");
        }
        self.master.send_frame(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Collector, heap_frame};

    #[test]
    fn same_seed_same_losses() {
        let mut a = LossModel::new(7, 0.3);
        let mut b = LossModel::new(7, 0.3);
        let pattern_a: Vec<bool> = (0..64).map(|_| a.lose()).collect();
        let pattern_b: Vec<bool> = (0..64).map(|_| b.lose()).collect();
        assert_eq!(pattern_a, pattern_b);
        assert!(pattern_a.contains(&true));
        assert!(pattern_a.contains(&false));
    }

    #[test]
    fn rate_extremes() {
        let link = LossyLink::new(1, 0.0);
        let sink = Collector::new();
        link.master().add_slave(sink.clone());
        for _ in 0..10 {
            link.accept_frame(heap_frame(b"x").unwrap()).unwrap();
        }
        link.set_rate(1.0);
        for _ in 0..10 {
            link.accept_frame(heap_frame(b"y").unwrap()).unwrap();
        }
        assert_eq!((link.passed(), link.lost()), (10, 10));
        assert_eq!(sink.len(), 10);
    }

    #[test]
    fn corrupts_only_the_chosen_frame() {
        let corrupter = Arc::new(Corrupter::new(1, 2));
        let sink = Collector::new();
        corrupter.master().add_slave(sink.clone());
        for _ in 0..3 {
            corrupter.accept_frame(heap_frame(&[0u8; 4]).unwrap()).unwrap();
        }
        assert_eq!(sink.payloads(), vec![vec![0; 4], vec![0, 0, 0xFF, 0], vec![0; 4]]);
        assert_eq!(corrupter.seen(), 3);
    }
}
