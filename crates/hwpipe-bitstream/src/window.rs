//! Fixed-capacity sliding byte window over a compressed input stream.
//!
//! ```text
//!  0            read_cursor              fill_level          capacity
//!  ├──consumed───┼────────pending──────────┼──────free──────────┤
//! ```
//!
//! `refill` slides the pending bytes to the front and reads new input
//! after them, so an access unit that straddles two reads stays whole.

use std::io::{ErrorKind, Read};

/// Default window size (1 MiB), also the largest access unit that can be
/// extracted without being dropped.
pub const DEFAULT_WINDOW_CAPACITY: usize = 1 << 20;

/// Smallest usable window: one start code plus the HEVC lookahead.
pub const MIN_WINDOW_CAPACITY: usize = 8;

/// Working buffer for the access-unit extractor.
///
/// Invariant: `read_cursor <= fill_level <= capacity`.
#[derive(Debug)]
pub struct ByteWindow {
    buf: Box<[u8]>,
    read_cursor: usize,
    fill_level: usize,
}

impl ByteWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(MIN_WINDOW_CAPACITY)].into_boxed_slice(),
            read_cursor: 0,
            fill_level: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn fill_level(&self) -> usize {
        self.fill_level
    }

    /// Valid bytes, including the already-consumed prefix.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.fill_level]
    }

    /// Valid bytes not yet consumed.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.read_cursor..self.fill_level]
    }

    /// No room left even after sliding: the pending bytes fill the window.
    pub fn is_full(&self) -> bool {
        self.read_cursor == 0 && self.fill_level == self.buf.len()
    }

    /// Mark everything before `pos` as consumed.
    pub fn advance_to(&mut self, pos: usize) {
        debug_assert!(pos >= self.read_cursor && pos <= self.fill_level);
        self.read_cursor = pos.clamp(self.read_cursor, self.fill_level);
    }

    /// Drop pending bytes, keeping only the last `keep`.  Returns the number
    /// of bytes dropped.
    pub fn discard_keep_tail(&mut self, keep: usize) -> usize {
        let new_cursor = self.fill_level.saturating_sub(keep).max(self.read_cursor);
        let dropped = new_cursor - self.read_cursor;
        self.read_cursor = new_cursor;
        dropped
    }

    /// Slide the pending bytes to offset 0.
    pub fn compact(&mut self) {
        if self.read_cursor == 0 {
            return;
        }
        self.buf.copy_within(self.read_cursor..self.fill_level, 0);
        self.fill_level -= self.read_cursor;
        self.read_cursor = 0;
    }

    /// Slide, then append one read's worth of input.
    ///
    /// Returns the number of bytes appended; `0` with free space available
    /// means the reader hit end of input.
    pub fn refill<R: Read + ?Sized>(&mut self, input: &mut R) -> std::io::Result<usize> {
        self.compact();
        if self.fill_level == self.buf.len() {
            return Ok(0);
        }
        loop {
            match input.read(&mut self.buf[self.fill_level..]) {
                Ok(n) => {
                    self.fill_level += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Slide, then copy as much of `bytes` as fits.  Returns bytes copied.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        self.compact();
        let n = bytes.len().min(self.buf.len() - self.fill_level);
        self.buf[self.fill_level..self.fill_level + n].copy_from_slice(&bytes[..n]);
        self.fill_level += n;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_slides_pending_tail_to_front() {
        let mut w = ByteWindow::new(8);
        assert_eq!(w.extend_from_slice(&[1, 2, 3, 4, 5, 6]), 6);
        w.advance_to(4);

        let mut input: &[u8] = &[7, 8, 9, 10, 11, 12, 13];
        let n = w.refill(&mut input).expect("refill");
        assert_eq!(n, 6);
        assert_eq!(w.read_cursor(), 0);
        assert_eq!(w.as_slice(), &[5, 6, 7, 8, 9, 10, 11, 12]);
        assert!(w.is_full());
    }

    #[test]
    fn refill_reports_end_of_input() {
        let mut w = ByteWindow::new(16);
        let mut input: &[u8] = &[];
        assert_eq!(w.refill(&mut input).expect("refill"), 0);
        assert!(!w.is_full());
    }

    #[test]
    fn discard_keeps_requested_tail() {
        let mut w = ByteWindow::new(8);
        w.extend_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(w.discard_keep_tail(2), 6);
        assert_eq!(w.pending(), &[6, 7]);
        assert!(w.read_cursor() <= w.fill_level());
    }

    #[test]
    fn tiny_capacity_is_raised_to_minimum() {
        assert_eq!(ByteWindow::new(1).capacity(), MIN_WINDOW_CAPACITY);
    }
}
