//! Fixed-size buffer arena.
//!
//! One contiguous block is allocated at startup and sliced into equal
//! segments. Segments are handed out once, in order, and stay bound to
//! their owner for the life of the server. Nothing is ever returned to the
//! arena; reuse happens one level up, in the context pool.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};

/// A single arena segment: a fixed-length view into the arena block.
///
/// The view never grows, so it never reallocates away from the block.
#[derive(Debug)]
pub struct Segment {
    offset: usize,
    buf: BytesMut,
}

impl Segment {
    /// Byte offset of this segment within the arena block.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Segment {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Monotonic slicer over one pre-allocated block.
pub struct BufferArena {
    /// Not-yet-handed-out tail of the block.
    block: BytesMut,
    /// Size of each segment.
    segment_size: usize,
    /// Total number of segments the block was sized for.
    segment_count: usize,
    /// Number of segments handed out so far.
    cursor: usize,
}

impl BufferArena {
    /// Allocate the backing block for `segment_count` segments of
    /// `segment_size` bytes each.
    ///
    /// # Panics
    /// Panics if the block size overflows `usize`.
    pub fn initialize(segment_size: usize, segment_count: usize) -> Self {
        let len = segment_size
            .checked_mul(segment_count)
            .unwrap_or_else(|| panic!("buffer arena size overflows: {segment_size} x {segment_count}"));

        Self {
            block: BytesMut::zeroed(len),
            segment_size,
            segment_count,
            cursor: 0,
        }
    }

    /// Hand out the next unused segment.
    ///
    /// # Panics
    /// Panics once all `segment_count` segments have been handed out. With the
    /// pool sized from the same connection limit this cannot happen.
    pub fn next_segment(&mut self) -> Segment {
        assert!(
            self.cursor < self.segment_count,
            "buffer arena exhausted: all {} segments already handed out",
            self.segment_count
        );

        let offset = self.cursor * self.segment_size;
        let buf = self.block.split_to(self.segment_size);
        self.cursor += 1;

        Segment { offset, buf }
    }

    /// Size of each segment.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Total length of the backing block.
    pub fn len(&self) -> usize {
        self.segment_size * self.segment_count
    }

    /// Number of segments already handed out.
    pub fn allocated(&self) -> usize {
        self.cursor
    }

    /// Number of segments still available.
    pub fn remaining(&self) -> usize {
        self.segment_count - self.cursor
    }
}
