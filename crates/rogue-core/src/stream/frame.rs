//! Frames and frame locks.
//!
//! A [`Frame`] is an ordered chain of [`Buffer`]s that together carry one
//! logical message. All of its state sits behind one mutex; holding the
//! [`FrameLock`] returned by [`Frame::lock`] is the only way to read or
//! modify it.
//!
//! The logical payload is the concatenation of the buffers' payloads. Growing
//! the payload fills the last occupied buffer first and then the empty
//! buffers after it, so bytes already written never move.

use std::{
    cell::Cell,
    fmt, io, ptr,
    sync::Arc,
};

use parking_lot::{Mutex, MutexGuard};

use super::{
    buffer::Buffer,
    iterator::{FrameIterator, FrameIteratorMut},
};
use crate::error::{Error, Result};

/// Shared handle to a frame.
pub type FramePtr = Arc<Frame>;

/// SSI first-user bit marking start of frame.
pub const SSI_SOF: u8 = 0x02;
/// SSI last-user bit marking end of frame with error.
pub const SSI_EOFE: u8 = 0x01;

#[derive(Default)]
struct FrameState {
    buffers: Vec<Buffer>,
    channel: u8,
    flags: u16,
    error: u8,
    first_user: u8,
    last_user: u8,
    payload: Cell<usize>,
    size_dirty: Cell<bool>,
}

/// One logical message made of pool buffers.
#[derive(Default)]
pub struct Frame {
    state: Mutex<FrameState>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Some(state) => f
                .debug_struct("Frame")
                .field("buffers", &state.buffers.len())
                .field("channel", &state.channel)
                .field("error", &state.error)
                .finish_non_exhaustive(),
            None => f.write_str("Frame { <locked> }"),
        }
    }
}

impl Frame {
    /// Empty frame with no buffers.
    pub fn new() -> FramePtr {
        Arc::new(Self::default())
    }

    /// Acquire exclusive access.
    pub fn lock(&self) -> FrameLock<'_> {
        FrameLock { guard: self.state.lock(), frame: self }
    }
}

/// Exclusive access to a frame's metadata and payload.
///
/// Released when dropped or on [`unlock`](Self::unlock).
pub struct FrameLock<'a> {
    guard: MutexGuard<'a, FrameState>,
    frame: &'a Frame,
}

impl fmt::Debug for FrameLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLock")
            .field("buffers", &self.guard.buffers.len())
            .field("payload", &self.payload())
            .field("channel", &self.guard.channel)
            .finish_non_exhaustive()
    }
}

impl<'a> FrameLock<'a> {
    /// Release the lock.
    pub fn unlock(self) {}

    /// Run `f` with the lock released, re-acquiring it afterwards.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        MutexGuard::unlocked(&mut self.guard, f)
    }

    /// The locked frame.
    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    fn mark_dirty(&self) {
        self.guard.size_dirty.set(true);
    }

    /// Append a buffer at the end of the chain.
    pub fn append_buffer(&mut self, buffer: Buffer) {
        self.guard.buffers.push(buffer);
        self.mark_dirty();
    }

    /// Move every buffer of `donor` to the end of this frame.
    pub fn append_frame(&mut self, donor: &Frame) -> Result<()> {
        if ptr::eq(self.frame, donor) {
            return Err(Error::Unsupported("appending a frame to itself"));
        }
        let mut other = donor.lock();
        let moved = std::mem::take(&mut other.guard.buffers);
        other.mark_dirty();
        drop(other);
        self.guard.buffers.extend(moved);
        self.mark_dirty();
        Ok(())
    }

    /// Remove and return every buffer.
    pub fn take_buffers(&mut self) -> Vec<Buffer> {
        self.mark_dirty();
        std::mem::take(&mut self.guard.buffers)
    }

    /// Drop every buffer.
    pub fn clear(&mut self) {
        self.guard.buffers.clear();
        self.mark_dirty();
    }

    /// Buffers in order.
    pub fn buffers(&self) -> &[Buffer] {
        &self.guard.buffers
    }

    /// Buffers in order, mutable.
    pub fn buffers_mut(&mut self) -> &mut [Buffer] {
        self.mark_dirty();
        &mut self.guard.buffers
    }

    /// Number of buffers.
    pub fn buffer_count(&self) -> usize {
        self.guard.buffers.len()
    }

    /// Total payload capacity, headroom excluded.
    pub fn size(&self) -> usize {
        self.guard.buffers.iter().map(Buffer::size).sum()
    }

    /// Payload bytes across all buffers.
    pub fn payload(&self) -> usize {
        let state = &*self.guard;
        if state.size_dirty.get() {
            state.payload.set(state.buffers.iter().map(Buffer::payload).sum());
            state.size_dirty.set(false);
        }
        state.payload.get()
    }

    /// Largest payload reachable without moving written bytes.
    fn capacity(&self) -> usize {
        let buffers = &self.guard.buffers;
        let last = last_occupied(buffers);
        let kept: usize = buffers[..last].iter().map(Buffer::payload).sum();
        let open: usize = buffers[last..].iter().map(Buffer::size).sum();
        kept + open
    }

    /// Bytes the payload can still grow by.
    pub fn available(&self) -> usize {
        self.capacity() - self.payload()
    }

    /// Set the payload length, growing into free space or trimming the end.
    pub fn set_payload(&mut self, size: usize) -> Result<()> {
        let capacity = self.capacity();
        if size > capacity {
            return Err(Error::boundary("frame payload", size, capacity));
        }
        let buffers = &mut self.guard.buffers;
        let last = last_occupied(buffers);
        let mut remaining = size;
        for (i, buffer) in buffers.iter_mut().enumerate() {
            let take = if i < last {
                buffer.payload().min(remaining)
            } else {
                buffer.size().min(remaining)
            };
            buffer.set_payload(take)?;
            remaining -= take;
        }
        self.mark_dirty();
        Ok(())
    }

    /// Grow the payload to at least `size`.
    pub fn min_payload(&mut self, size: usize) -> Result<()> {
        if self.payload() < size {
            self.set_payload(size)?;
        }
        Ok(())
    }

    /// Grow or shrink the payload by `delta` bytes.
    pub fn adjust_payload(&mut self, delta: isize) -> Result<()> {
        let payload = self.payload();
        let size = payload
            .checked_add_signed(delta)
            .ok_or(Error::boundary("frame payload adjust", delta.unsigned_abs(), payload))?;
        self.set_payload(size)
    }

    /// Drop `count` bytes from the front of the payload by moving buffer
    /// headroom forward.
    pub fn strip_header(&mut self, count: usize) -> Result<()> {
        let payload = self.payload();
        if count > payload {
            return Err(Error::boundary("header strip", count, payload));
        }
        let mut remaining = count;
        for buffer in &mut self.guard.buffers {
            if remaining == 0 {
                break;
            }
            let take = buffer.payload().min(remaining);
            buffer.adjust_header(take as isize)?;
            remaining -= take;
        }
        self.mark_dirty();
        Ok(())
    }

    /// Drop `count` bytes from the end of the payload.
    pub fn strip_tail(&mut self, count: usize) -> Result<()> {
        let payload = self.payload();
        if count > payload {
            return Err(Error::boundary("tail strip", count, payload));
        }
        self.set_payload(payload - count)
    }

    /// Destination channel.
    pub fn channel(&self) -> u8 {
        self.guard.channel
    }

    /// Set the destination channel.
    pub fn set_channel(&mut self, channel: u8) {
        self.guard.channel = channel;
    }

    /// Frame flags.
    pub fn flags(&self) -> u16 {
        self.guard.flags
    }

    /// Set frame flags.
    pub fn set_flags(&mut self, flags: u16) {
        self.guard.flags = flags;
    }

    /// Frame error byte; non-zero marks the data as suspect.
    pub fn error(&self) -> u8 {
        self.guard.error
    }

    /// Set the frame error byte.
    pub fn set_error(&mut self, error: u8) {
        self.guard.error = error;
    }

    /// First-user byte.
    pub fn first_user(&self) -> u8 {
        self.guard.first_user
    }

    /// Set the first-user byte.
    pub fn set_first_user(&mut self, value: u8) {
        self.guard.first_user = value;
    }

    /// Last-user byte.
    pub fn last_user(&self) -> u8 {
        self.guard.last_user
    }

    /// Set the last-user byte.
    pub fn set_last_user(&mut self, value: u8) {
        self.guard.last_user = value;
    }

    /// SSI start-of-frame bit of the first-user byte.
    pub fn sof(&self) -> bool {
        self.guard.first_user & SSI_SOF != 0
    }

    /// Set or clear the SSI start-of-frame bit.
    pub fn set_sof(&mut self, sof: bool) {
        if sof {
            self.guard.first_user |= SSI_SOF;
        } else {
            self.guard.first_user &= !SSI_SOF;
        }
    }

    /// SSI end-of-frame-error bit of the last-user byte.
    pub fn eofe(&self) -> bool {
        self.guard.last_user & SSI_EOFE != 0
    }

    /// Set or clear the SSI end-of-frame-error bit.
    pub fn set_eofe(&mut self, eofe: bool) {
        if eofe {
            self.guard.last_user |= SSI_EOFE;
        } else {
            self.guard.last_user &= !SSI_EOFE;
        }
    }

    /// Copy metadata (channel, flags, error, user bytes) from another frame.
    pub fn copy_meta(&mut self, from: &FrameLock<'_>) {
        self.guard.channel = from.guard.channel;
        self.guard.flags = from.guard.flags;
        self.guard.error = from.guard.error;
        self.guard.first_user = from.guard.first_user;
        self.guard.last_user = from.guard.last_user;
    }

    /// Read iterator from the start of the payload.
    pub fn begin_read(&self) -> FrameIterator<'_> {
        FrameIterator::new(&self.guard.buffers, self.payload())
    }

    /// Write iterator over the current payload.
    ///
    /// The iterator only covers bytes inside the payload; call
    /// [`set_payload`](Self::set_payload) first to make room.
    pub fn begin_write(&mut self) -> FrameIteratorMut<'_> {
        let payload = self.payload();
        FrameIteratorMut::new(&mut self.guard.buffers, payload)
    }

    /// Copy `dst.len()` payload bytes starting at `offset`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let payload = self.payload();
        if offset + dst.len() > payload {
            return Err(Error::boundary("frame read", offset + dst.len(), payload));
        }
        let mut iter = self.begin_read();
        iter.advance(offset)?;
        iter.copy_to(dst)
    }

    /// Copy `src` into the payload at `offset`, growing the payload as needed.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.min_payload(offset + src.len())?;
        let mut iter = self.begin_write();
        iter.advance(offset)?;
        iter.copy_from(src)
    }

    /// Append `count` payload bytes of `src`, starting at `src_offset`, to
    /// the end of this frame's payload.
    pub fn copy_payload_from(
        &mut self,
        src: &FrameLock<'_>,
        src_offset: usize,
        count: usize,
    ) -> Result<()> {
        let mut iter = src.begin_read();
        iter.advance(src_offset)?;
        if count > iter.size() {
            return Err(Error::boundary("frame copy", count, iter.size()));
        }
        let mut offset = self.payload();
        let mut left = count;
        for chunk in iter.chunks() {
            if left == 0 {
                break;
            }
            let take = chunk.len().min(left);
            self.write(offset, &chunk[..take])?;
            offset += take;
            left -= take;
        }
        Ok(())
    }

    /// Whole payload as a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.guard.buffers.iter().flat_map(|b| b.data().iter().copied()).collect()
    }

    /// `std::io::Read` over the payload.
    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader { iter: self.begin_read() }
    }

    /// `std::io::Write` appending to the payload.
    pub fn writer(&mut self) -> FrameWriter<'_, 'a> {
        FrameWriter { lock: self }
    }
}

fn last_occupied(buffers: &[Buffer]) -> usize {
    buffers.iter().rposition(|b| b.payload() > 0).unwrap_or(0)
}

/// Reader over a locked frame's payload.
#[derive(Debug)]
pub struct FrameReader<'l> {
    iter: FrameIterator<'l>,
}

impl io::Read for FrameReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.iter.size());
        self.iter.copy_to(&mut buf[..count]).map_err(io::Error::other)?;
        Ok(count)
    }
}

/// Writer appending to a locked frame.
#[derive(Debug)]
pub struct FrameWriter<'l, 'a> {
    lock: &'l mut FrameLock<'a>,
}

impl io::Write for FrameWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = buf.len().min(self.lock.available());
        let offset = self.lock.payload();
        self.lock.write(offset, &buf[..count]).map_err(io::Error::other)?;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
