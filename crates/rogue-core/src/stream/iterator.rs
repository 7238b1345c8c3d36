//! Byte iterators spanning buffer boundaries.
//!
//! Both iterators walk the payload of a frame as one logical byte stream.
//! [`FrameIterator::ptr`] and [`FrameIteratorMut::ptr_mut`] expose the run of
//! bytes left in the current buffer for bulk copies; `copy_to` and
//! `copy_from` do the boundary bookkeeping themselves.

use std::ops::AddAssign;

use super::buffer::Buffer;
use crate::error::{Error, Result};

/// Position within a buffer chain.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    index: usize,
    offset: usize,
    remaining: usize,
}

impl Cursor {
    fn new(buffers: &[Buffer], total: usize) -> Self {
        let mut cursor = Self { index: 0, offset: 0, remaining: total };
        cursor.settle(buffers);
        cursor
    }

    /// Skip exhausted and empty buffers.
    fn settle(&mut self, buffers: &[Buffer]) {
        while self.index < buffers.len() && self.offset >= buffers[self.index].payload() {
            self.index += 1;
            self.offset = 0;
        }
    }

    fn rem_buffer(&self, buffers: &[Buffer]) -> usize {
        buffers
            .get(self.index)
            .map_or(0, |b| (b.payload() - self.offset).min(self.remaining))
    }

    fn advance(&mut self, buffers: &[Buffer], mut count: usize) -> Result<()> {
        if count > self.remaining {
            return Err(Error::boundary("iterator advance", count, self.remaining));
        }
        while count > 0 {
            let step = self.rem_buffer(buffers).min(count);
            if step == 0 {
                return Err(Error::boundary("iterator advance", count, 0));
            }
            self.offset += step;
            self.remaining -= step;
            count -= step;
            self.settle(buffers);
        }
        Ok(())
    }
}

/// Read-only iterator over a frame's payload.
#[derive(Debug, Clone)]
pub struct FrameIterator<'a> {
    buffers: &'a [Buffer],
    cursor: Cursor,
}

impl<'a> FrameIterator<'a> {
    pub(crate) fn new(buffers: &'a [Buffer], total: usize) -> Self {
        Self { buffers, cursor: Cursor::new(buffers, total) }
    }

    /// Bytes left to the end of the payload.
    pub fn size(&self) -> usize {
        self.cursor.remaining
    }

    /// Bytes left in the current buffer.
    pub fn rem_buffer(&self) -> usize {
        self.cursor.rem_buffer(self.buffers)
    }

    /// Bytes left in the current buffer, as a slice.
    pub fn ptr(&self) -> &'a [u8] {
        let len = self.rem_buffer();
        match self.buffers.get(self.cursor.index) {
            Some(buffer) => &buffer.data()[self.cursor.offset..self.cursor.offset + len],
            None => &[],
        }
    }

    /// Move forward by `count` bytes.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        self.cursor.advance(self.buffers, count)
    }

    /// Fill `dst` from the current position and advance past the copied
    /// bytes.
    pub fn copy_to(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.size() {
            return Err(Error::boundary("iterator read", dst.len(), self.size()));
        }
        let mut done = 0;
        while done < dst.len() {
            let chunk = self.ptr();
            let count = chunk.len().min(dst.len() - done);
            dst[done..done + count].copy_from_slice(&chunk[..count]);
            self.advance(count)?;
            done += count;
        }
        Ok(())
    }

    /// Iterate the remaining payload as buffer-sized chunks.
    pub fn chunks(self) -> impl Iterator<Item = &'a [u8]> {
        let mut iter = self;
        std::iter::from_fn(move || {
            let chunk = iter.ptr();
            if chunk.is_empty() {
                return None;
            }
            iter.advance(chunk.len()).ok()?;
            Some(chunk)
        })
    }
}

impl AddAssign<usize> for FrameIterator<'_> {
    /// Advance, stopping at the end of the payload.
    fn add_assign(&mut self, count: usize) {
        let count = count.min(self.size());
        let _ = self.advance(count);
    }
}

impl Iterator for FrameIterator<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let byte = *self.ptr().first()?;
        self.advance(1).ok()?;
        Some(byte)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.size(), Some(self.size()))
    }
}

impl ExactSizeIterator for FrameIterator<'_> {}

/// Mutable iterator over a frame's payload.
#[derive(Debug)]
pub struct FrameIteratorMut<'a> {
    buffers: &'a mut [Buffer],
    cursor: Cursor,
}

impl<'a> FrameIteratorMut<'a> {
    pub(crate) fn new(buffers: &'a mut [Buffer], total: usize) -> Self {
        let cursor = Cursor::new(buffers, total);
        Self { buffers, cursor }
    }

    /// Bytes left to the end of the payload.
    pub fn size(&self) -> usize {
        self.cursor.remaining
    }

    /// Bytes left in the current buffer.
    pub fn rem_buffer(&self) -> usize {
        self.cursor.rem_buffer(self.buffers)
    }

    /// Bytes left in the current buffer, as a mutable slice.
    pub fn ptr_mut(&mut self) -> &mut [u8] {
        let len = self.rem_buffer();
        let offset = self.cursor.offset;
        match self.buffers.get_mut(self.cursor.index) {
            Some(buffer) => &mut buffer.data_mut()[offset..offset + len],
            None => &mut [],
        }
    }

    /// Move forward by `count` bytes.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        self.cursor.advance(self.buffers, count)
    }

    /// Copy `src` in at the current position and advance past it.
    pub fn copy_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.size() {
            return Err(Error::boundary("iterator write", src.len(), self.size()));
        }
        let mut done = 0;
        while done < src.len() {
            let chunk = self.ptr_mut();
            let count = chunk.len().min(src.len() - done);
            chunk[..count].copy_from_slice(&src[done..done + count]);
            self.advance(count)?;
            done += count;
        }
        Ok(())
    }

    /// Fill `count` bytes with `value`.
    pub fn fill(&mut self, value: u8, count: usize) -> Result<()> {
        if count > self.size() {
            return Err(Error::boundary("iterator fill", count, self.size()));
        }
        let mut left = count;
        while left > 0 {
            let chunk = self.ptr_mut();
            let n = chunk.len().min(left);
            chunk[..n].fill(value);
            self.advance(n)?;
            left -= n;
        }
        Ok(())
    }
}
