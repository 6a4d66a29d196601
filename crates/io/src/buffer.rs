//! Stream input buffer: a fixed-capacity byte window with `start`/`end`
//! cursors (spec §3, "Parser State"). Unlike the original's ring buffer
//! with an embedded parser-state tail, this is a linear buffer compacted
//! on demand — Rust's ownership model makes a `Vec<u8>` plus compaction as
//! cheap and considerably simpler than hand-rolled ring arithmetic, with
//! the same externally observable contract (§4.4 read contract).

use crate::error::IoError;

/// Default capacity for a stream's input buffer. Generous enough for
/// HTTP request lines and headers without needing compaction on the
/// common path.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16 * 1024;

pub struct StreamBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
    capacity: usize,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            start: 0,
            end: 0,
            capacity,
        }
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Drops the first `n` bytes of the filled region (the parser has
    /// consumed them).
    pub fn consume(&mut self, n: usize) {
        self.start += n;
        debug_assert!(self.start <= self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// True if there's room to append at least one more byte after
    /// compacting.
    pub fn has_spare_capacity(&mut self) -> bool {
        self.compact();
        self.end < self.capacity
    }

    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.data[self.end..self.capacity]
    }

    pub fn note_appended(&mut self, n: usize) {
        self.end += n;
        debug_assert!(self.end <= self.capacity);
    }

    pub fn is_full_with_no_progress(&self) -> bool {
        self.start == 0 && self.end == self.capacity
    }
}

/// An incremental parser operating over a [`StreamBuffer`]'s filled
/// region. Implementations consume exactly as many bytes as they use by
/// calling [`StreamBuffer::consume`] themselves before returning
/// `Ok(Some(_))`.
pub trait StreamParser {
    type Output;

    fn parse(&mut self, buf: &mut StreamBuffer) -> Result<Option<Self::Output>, IoError>;
}
