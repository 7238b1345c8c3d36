//! Heap buffer pool.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{error, trace};

use super::{
    buffer::{Buffer, BufferSource, Region, next_meta},
    frame::{Frame, FramePtr},
};
use crate::error::{Error, Result};

#[derive(Default)]
struct PoolState {
    free: Vec<Box<dyn Region>>,
    fixed_size: usize,
    pool_size: usize,
    compact: bool,
    alloc_bytes: usize,
    alloc_count: usize,
    last_meta: Option<u32>,
}

#[derive(Default)]
struct PoolShared {
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn release(&self, region: Box<dyn Region>, meta: u32, raw_size: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.last_meta == Some(meta) {
            return Err(Error::DoubleFree(meta));
        }
        state.last_meta = Some(meta);
        state.alloc_bytes = state.alloc_bytes.saturating_sub(raw_size);
        state.alloc_count = state.alloc_count.saturating_sub(1);

        if state.fixed_size > 0
            && raw_size == state.fixed_size
            && state.free.len() < state.pool_size
        {
            state.free.push(region);
        }
        Ok(())
    }
}

impl BufferSource for PoolShared {
    fn ret_buffer(&self, region: Box<dyn Region>, meta: u32, raw_size: usize) {
        if let Err(e) = self.release(region, meta, raw_size) {
            error!(meta, error = %e, "buffer return rejected");
        }
    }
}

/// Allocator and recycler of heap buffers.
///
/// Cloning a pool yields another handle to the same free list and counters.
/// Buffers keep their pool alive until they drop.
///
/// With a fixed buffer size every buffer has exactly that capacity and
/// requests are built from chained fixed-size buffers; up to `pool_size`
/// freed regions are cached and reused instead of going back to the
/// allocator.
#[derive(Clone, Default)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("fixed_size", &state.fixed_size)
            .field("pool_size", &state.pool_size)
            .field("alloc_bytes", &state.alloc_bytes)
            .field("alloc_count", &state.alloc_count)
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Pool with no fixed size and no caching.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use fixed-size buffers (0 disables).
    pub fn set_fixed_size(&self, size: usize) {
        let mut state = self.shared.state.lock();
        state.fixed_size = size;
        state.free.clear();
    }

    /// Fixed buffer size, or 0.
    pub fn fixed_size(&self) -> usize {
        self.shared.state.lock().fixed_size
    }

    /// Maximum number of cached free regions.
    pub fn set_pool_size(&self, count: usize) {
        let mut state = self.shared.state.lock();
        state.pool_size = count;
        let keep = count.min(state.free.len());
        state.free.truncate(keep);
    }

    /// Size the last chunk of a chained request to the remainder.
    pub fn set_compact(&self, compact: bool) {
        self.shared.state.lock().compact = compact;
    }

    /// Bytes currently held by live buffers.
    pub fn alloc_bytes(&self) -> usize {
        self.shared.state.lock().alloc_bytes
    }

    /// Number of live buffers.
    pub fn alloc_count(&self) -> usize {
        self.shared.state.lock().alloc_count
    }

    /// Number of cached free regions.
    pub fn free_count(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Build a frame with room for at least `size` payload bytes.
    ///
    /// With `max_buf_size == 0` (and no fixed size) the frame holds a single
    /// buffer of exactly `size` bytes; otherwise buffers of `max_buf_size`
    /// are chained until the capacity covers `size`. Heap pools never hand
    /// out zero-copy memory, so `zero_copy_ok` is ignored here.
    pub fn accept_req(
        &self,
        size: usize,
        _zero_copy_ok: bool,
        max_buf_size: usize,
    ) -> Result<FramePtr> {
        let (fixed, compact) = {
            let state = self.shared.state.lock();
            (state.fixed_size, state.compact)
        };
        let chunk = if fixed > 0 { fixed } else { max_buf_size };

        let frame = Frame::new();
        {
            let mut lock = frame.lock();
            if chunk == 0 {
                lock.append_buffer(self.alloc_buffer(size)?);
            } else {
                let mut total = 0;
                loop {
                    let remaining = size - total;
                    let this = if compact && fixed == 0 && remaining < chunk {
                        remaining
                    } else {
                        chunk
                    };
                    lock.append_buffer(self.alloc_buffer(this)?);
                    total += this;
                    if total >= size {
                        break;
                    }
                }
            }
        }
        trace!(size, max_buf_size, "frame allocated");
        Ok(frame)
    }

    /// Allocate a single buffer of `size` bytes.
    pub fn alloc_buffer(&self, size: usize) -> Result<Buffer> {
        let cached = {
            let mut state = self.shared.state.lock();
            if state.fixed_size > 0 && size == state.fixed_size { state.free.pop() } else { None }
        };
        let region = match cached {
            Some(region) => region,
            None => allocate(size)?,
        };

        {
            let mut state = self.shared.state.lock();
            state.alloc_bytes += size;
            state.alloc_count += 1;
        }
        let source: Arc<dyn BufferSource> = self.shared.clone();
        Ok(Buffer::new(source, region, next_meta(), size))
    }

    /// Return a region directly, as a buffer drop does.
    ///
    /// Fails with [`Error::DoubleFree`] when `meta` matches the most recently
    /// returned buffer.
    pub fn ret_buffer(&self, region: Box<dyn Region>, meta: u32, raw_size: usize) -> Result<()> {
        self.shared.release(region, meta, raw_size)
    }
}

fn allocate(size: usize) -> Result<Box<dyn Region>> {
    let mut data = Vec::new();
    if data.try_reserve_exact(size).is_err() {
        error!(size, "buffer allocation failed");
        return Err(Error::Allocation(size));
    }
    data.resize(size, 0);
    Ok(Box::new(data.into_boxed_slice()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn chained_request() {
        let pool = Pool::new();
        let frame = pool.accept_req(1024, true, 256).unwrap();
        {
            let lock = frame.lock();
            assert_eq!(lock.buffer_count(), 4);
            assert!(lock.buffers().iter().all(|b| b.raw_size() == 256));
        }
        assert_eq!(pool.alloc_bytes(), 1024);
        assert_eq!(pool.alloc_count(), 4);
        drop(frame);
        assert_eq!(pool.alloc_bytes(), 0);
        assert_eq!(pool.alloc_count(), 0);
    }

    #[test]
    fn single_buffer_request() {
        let pool = Pool::new();
        let frame = pool.accept_req(100, false, 0).unwrap();
        let lock = frame.lock();
        assert_eq!(lock.buffer_count(), 1);
        assert_eq!(lock.available(), 100);
    }

    #[test]
    fn compact_last_chunk() {
        let pool = Pool::new();
        pool.set_compact(true);
        let frame = pool.accept_req(600, false, 256).unwrap();
        let sizes: Vec<_> = frame.lock().buffers().iter().map(Buffer::raw_size).collect();
        assert_eq!(sizes, vec![256, 256, 88]);
    }

    #[test]
    fn fixed_size_regions_are_recycled() {
        let pool = Pool::new();
        pool.set_fixed_size(128);
        pool.set_pool_size(8);

        let frame = pool.accept_req(300, false, 0).unwrap();
        assert_eq!(frame.lock().buffer_count(), 3);
        drop(frame);
        assert_eq!(pool.free_count(), 3);

        let frame = pool.accept_req(128, false, 0).unwrap();
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.alloc_bytes(), 128);
        drop(frame);
    }

    #[test]
    fn double_return_is_rejected() {
        let pool = Pool::new();
        let region: Box<dyn Region> = Box::new(vec![0u8; 4]);
        pool.ret_buffer(region, 42, 4).unwrap();
        let region: Box<dyn Region> = Box::new(vec![0u8; 4]);
        assert!(matches!(pool.ret_buffer(region, 42, 4), Err(Error::DoubleFree(42))));
    }

    proptest! {
        #[test]
        fn alloc_bytes_tracks_live_buffers(sizes in proptest::collection::vec(1usize..512, 1..16), keep in any::<u16>()) {
            let pool = Pool::new();
            let mut live = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                let buffer = pool.alloc_buffer(*size).unwrap();
                if keep & (1 << (i % 16)) != 0 {
                    live.push(buffer);
                }
            }
            let expected: usize = live.iter().map(Buffer::raw_size).sum();
            prop_assert_eq!(pool.alloc_bytes(), expected);
            drop(live);
            prop_assert_eq!(pool.alloc_bytes(), 0);
        }
    }
}
