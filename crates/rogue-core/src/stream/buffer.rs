//! Pool-owned byte regions.
//!
//! A [`Buffer`] wraps one contiguous [`Region`] handed out by a
//! [`BufferSource`]. The region is split into three windows:
//!
//! ```text
//! 0            head_room          used             raw_size
//! |  headroom  |     payload      |    available    |
//! ```
//!
//! Headroom is space reserved in front of the payload for protocol headers
//! written later. `head_room <= used <= raw_size` always holds. When the
//! buffer drops, the region goes back to its source together with its meta
//! id, which is how zero-copy sources learn which descriptor was released.

use std::{
    fmt, ptr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use crate::error::{Error, Result};

/// Meta tag: region belongs to a zero-copy (driver-mapped) source.
pub const META_ZERO_COPY: u32 = 0x8000_0000;
/// Meta tag: region was handed to the driver and must not be reused yet.
pub const META_STALE: u32 = 0x4000_0000;
/// Bits of a meta value that identify the buffer.
pub const META_ID_MASK: u32 = 0x00FF_FFFF;

static NEXT_META: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-wide meta id (low 24 bits, never zero).
pub fn next_meta() -> u32 {
    loop {
        let meta = NEXT_META.fetch_add(1, Ordering::Relaxed) & META_ID_MASK;
        if meta != 0 {
            return meta;
        }
    }
}

/// A contiguous byte region that can back a [`Buffer`].
pub trait Region: Send + Sync {
    /// Whole region.
    fn as_slice(&self) -> &[u8];

    /// Whole region, mutable.
    fn as_mut_slice(&mut self) -> &mut [u8];
}

impl Region for Vec<u8> {
    fn as_slice(&self) -> &[u8] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self
    }
}

impl Region for Box<[u8]> {
    fn as_slice(&self) -> &[u8] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self
    }
}

/// Producer of buffers; receives their regions back when they drop.
pub trait BufferSource: Send + Sync {
    /// Take back a region previously handed out with `meta`.
    fn ret_buffer(&self, region: Box<dyn Region>, meta: u32, raw_size: usize);
}

/// One contiguous region with headroom and payload accounting.
pub struct Buffer {
    region: Option<Box<dyn Region>>,
    source: Arc<dyn BufferSource>,
    meta: u32,
    raw_size: usize,
    head_room: usize,
    used: usize,
    error: u8,
    flags: u32,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("meta", &format_args!("{:#x}", self.meta))
            .field("raw_size", &self.raw_size)
            .field("head_room", &self.head_room)
            .field("used", &self.used)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    /// Wrap a region produced by `source`.
    ///
    /// Only buffer sources call this; everything else obtains buffers
    /// through a pool's `accept_req`.
    pub fn new(
        source: Arc<dyn BufferSource>,
        region: Box<dyn Region>,
        meta: u32,
        raw_size: usize,
    ) -> Self {
        let raw_size = raw_size.min(region.as_slice().len());
        Self {
            region: Some(region),
            source,
            meta,
            raw_size,
            head_room: 0,
            used: 0,
            error: 0,
            flags: 0,
        }
    }

    fn raw(&self) -> &[u8] {
        match &self.region {
            Some(region) => &region.as_slice()[..self.raw_size],
            None => &[],
        }
    }

    fn raw_mut(&mut self) -> &mut [u8] {
        let raw_size = self.raw_size;
        match &mut self.region {
            Some(region) => &mut region.as_mut_slice()[..raw_size],
            None => &mut [],
        }
    }

    /// Meta id assigned by the source.
    pub fn meta(&self) -> u32 {
        self.meta
    }

    /// Replace the meta id (zero-copy sources tag buffers in flight).
    pub fn set_meta(&mut self, meta: u32) {
        self.meta = meta;
    }

    /// Whether this buffer will return to `source` when it drops.
    pub fn is_from(&self, source: &dyn BufferSource) -> bool {
        ptr::addr_eq(Arc::as_ptr(&self.source), ptr::from_ref(source))
    }

    /// Total region size.
    pub fn raw_size(&self) -> usize {
        self.raw_size
    }

    /// Bytes reserved in front of the payload.
    pub fn head_room(&self) -> usize {
        self.head_room
    }

    /// Reserve `head_room` bytes. Grows `used` if it would fall below.
    pub fn set_head_room(&mut self, head_room: usize) -> Result<()> {
        if head_room > self.raw_size {
            return Err(Error::boundary("head room", head_room, self.raw_size));
        }
        self.head_room = head_room;
        self.used = self.used.max(head_room);
        Ok(())
    }

    /// Move the payload start by `delta` bytes.
    ///
    /// A positive delta consumes the front of the payload (stripping a
    /// received header); a negative delta exposes headroom (prepending one).
    pub fn adjust_header(&mut self, delta: isize) -> Result<()> {
        let target = self.head_room.checked_add_signed(delta).filter(|h| *h <= self.used);
        match target {
            Some(head_room) => {
                self.head_room = head_room;
                Ok(())
            },
            None => Err(Error::boundary("header adjust", delta.unsigned_abs(), self.head_room)),
        }
    }

    /// Payload capacity: region size minus headroom.
    pub fn size(&self) -> usize {
        self.raw_size - self.head_room
    }

    /// Payload bytes.
    pub fn payload(&self) -> usize {
        self.used - self.head_room
    }

    /// Free bytes after the payload.
    pub fn available(&self) -> usize {
        self.raw_size - self.used
    }

    /// Set the payload length.
    pub fn set_payload(&mut self, size: usize) -> Result<()> {
        if size > self.size() {
            return Err(Error::boundary("payload", size, self.size()));
        }
        self.used = self.head_room + size;
        Ok(())
    }

    /// Set `used` directly (headroom included).
    pub fn set_size(&mut self, used: usize) -> Result<()> {
        if used < self.head_room || used > self.raw_size {
            return Err(Error::boundary("size", used, self.raw_size));
        }
        self.used = used;
        Ok(())
    }

    /// Grow or shrink the payload by `delta` bytes.
    pub fn adjust_payload(&mut self, delta: isize) -> Result<()> {
        let size = self
            .payload()
            .checked_add_signed(delta)
            .ok_or(Error::boundary("payload adjust", delta.unsigned_abs(), self.payload()))?;
        self.set_payload(size)
    }

    /// Payload bytes as a slice.
    pub fn data(&self) -> &[u8] {
        let (start, end) = (self.head_room, self.used);
        &self.raw()[start..end]
    }

    /// Payload bytes as a mutable slice.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.head_room, self.used);
        &mut self.raw_mut()[start..end]
    }

    /// Region from the payload start to the end of the buffer.
    pub fn window_mut(&mut self) -> &mut [u8] {
        let start = self.head_room;
        &mut self.raw_mut()[start..]
    }

    /// Headroom bytes in front of the payload.
    pub fn head_room_mut(&mut self) -> &mut [u8] {
        let end = self.head_room;
        &mut self.raw_mut()[..end]
    }

    /// Address of the first region byte, for zero-copy bookkeeping.
    pub fn as_ptr(&self) -> *const u8 {
        self.raw().as_ptr()
    }

    /// Copy payload bytes starting at `offset` into `dst`.
    ///
    /// Returns the number of bytes copied, clamped to the payload.
    pub fn read(&self, dst: &mut [u8], offset: usize) -> usize {
        let data = self.data();
        if offset >= data.len() {
            return 0;
        }
        let count = dst.len().min(data.len() - offset);
        dst[..count].copy_from_slice(&data[offset..offset + count]);
        count
    }

    /// Copy `src` into the payload window at `offset`.
    ///
    /// Clamped to the region end. The payload grows to cover the written
    /// bytes if they extend past it.
    pub fn write(&mut self, src: &[u8], offset: usize) -> usize {
        let capacity = self.size();
        if offset >= capacity {
            return 0;
        }
        let count = src.len().min(capacity - offset);
        let start = self.head_room + offset;
        self.raw_mut()[start..start + count].copy_from_slice(&src[..count]);
        self.used = self.used.max(start + count);
        count
    }

    /// Per-buffer error byte.
    pub fn error(&self) -> u8 {
        self.error
    }

    /// Set the per-buffer error byte.
    pub fn set_error(&mut self, error: u8) {
        self.error = error;
    }

    /// Per-buffer flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Set per-buffer flags.
    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.source.ret_buffer(region, self.meta, self.raw_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        returned: Mutex<Vec<(u32, usize)>>,
    }

    impl BufferSource for Recorder {
        fn ret_buffer(&self, _region: Box<dyn Region>, meta: u32, raw_size: usize) {
            self.returned.lock().push((meta, raw_size));
        }
    }

    fn buffer(source: &Arc<Recorder>, size: usize) -> Buffer {
        let source: Arc<dyn BufferSource> = source.clone();
        Buffer::new(source, Box::new(vec![0u8; size]), 7, size)
    }

    #[test]
    fn drop_returns_region() {
        let source = Arc::new(Recorder::default());
        drop(buffer(&source, 64));
        assert_eq!(*source.returned.lock(), vec![(7, 64)]);
    }

    #[test]
    fn knows_its_source() {
        let source = Arc::new(Recorder::default());
        let other = Recorder::default();
        let buf = buffer(&source, 4);
        assert!(buf.is_from(source.as_ref()));
        assert!(!buf.is_from(&other));
    }

    #[test]
    fn headroom_accounting() {
        let source = Arc::new(Recorder::default());
        let mut buf = buffer(&source, 32);
        buf.set_head_room(8).unwrap();
        assert_eq!(buf.payload(), 0);
        assert_eq!(buf.size(), 24);

        assert_eq!(buf.write(b"hello", 0), 5);
        assert_eq!(buf.payload(), 5);
        assert_eq!(buf.available(), 19);

        buf.adjust_header(-8).unwrap();
        assert_eq!(buf.payload(), 13);
        buf.adjust_header(8).unwrap();
        assert_eq!(buf.data(), b"hello");
        assert!(buf.adjust_header(5).is_ok());
        assert_eq!(buf.payload(), 0);
        assert!(buf.adjust_header(1).is_err());
    }

    #[test]
    fn read_and_write_clamp() {
        let source = Arc::new(Recorder::default());
        let mut buf = buffer(&source, 8);
        assert_eq!(buf.write(&[1u8; 12], 2), 6);
        assert_eq!(buf.payload(), 8);

        let mut out = [0u8; 16];
        assert_eq!(buf.read(&mut out, 4), 4);
        assert_eq!(buf.read(&mut out, 8), 0);
        assert!(buf.set_payload(9).is_err());
    }

    #[test]
    fn meta_ids_are_nonzero_and_distinct() {
        let a = next_meta();
        let b = next_meta();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(a & !META_ID_MASK, 0);
    }
}
