//! Sliding receive window shared by the FastCGI and HTTP layers.
//!
//! Socket reads rarely line up with protocol units: a CRLF, an 8-byte record
//! header or a multipart boundary can arrive split across two reads. A
//! [`ReceiveWindow`] keeps the unconsumed tail of previous reads around so a
//! search can be retried once more bytes have arrived, while its fixed
//! capacity bounds how much a single connection can make us hold.
//!
//! ```text
//!  0            start          start+len            capacity
//!  ├─ consumed ──┼──── pending ────┼────── free ──────────┤
//! ```
//!
//! Every [`append`](ReceiveWindow::append) first shifts the pending range
//! back to offset 0, so the free space is always contiguous.

use thiserror::Error;

/// Errors produced by the receive window.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The pending bytes plus the new chunk do not fit in the window. For a
    /// line-oriented parser this means a delimiter never showed up.
    #[error("receive window overflow: {pending} pending + {incoming} incoming exceeds {capacity} bytes")]
    Overflow {
        pending: usize,
        incoming: usize,
        capacity: usize,
    },
}

/// A fixed-capacity byte window with a pending range.
#[derive(Debug)]
pub struct ReceiveWindow {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
    received: u64,
}

impl ReceiveWindow {
    /// Creates a window holding at most `capacity` pending bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
            received: 0,
        }
    }

    /// Maximum number of pending bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes that can still be appended after compaction.
    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Number of pending (unconsumed) bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total number of bytes appended since creation or the last [`reset`](Self::reset).
    pub fn received(&self) -> u64 {
        self.received
    }

    /// The pending bytes.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    /// Compacts the pending range to offset 0 and appends `bytes`.
    ///
    /// An empty `bytes` is accepted and changes nothing.
    ///
    /// # Errors
    ///
    /// [`BufferError::Overflow`] if `bytes` does not fit in the free space.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() > self.free() {
            return Err(BufferError::Overflow {
                pending: self.len,
                incoming: bytes.len(),
                capacity: self.buf.len(),
            });
        }
        self.compact();
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.received += bytes.len() as u64;
        Ok(())
    }

    /// Offset (relative to the pending range) of the first occurrence of `pattern`.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        find_bytes(self.pending(), pattern)
    }

    /// Offset (relative to the pending range) of the last occurrence of `pattern`.
    pub fn rfind(&self, pattern: &[u8]) -> Option<usize> {
        rfind_bytes(self.pending(), pattern)
    }

    /// Removes the first `end` pending bytes plus `skip` more and returns the
    /// first `end`.
    ///
    /// # Panics
    ///
    /// Panics if `end + skip` exceeds the pending length.
    pub fn consume(&mut self, end: usize, skip: usize) -> &[u8] {
        assert!(
            end + skip <= self.len,
            "consume past pending range: {} + {} > {}",
            end,
            skip,
            self.len
        );
        let from = self.start;
        self.start += end + skip;
        self.len -= end + skip;
        if self.len == 0 {
            self.start = 0;
        }
        &self.buf[from..from + end]
    }

    /// Like [`consume`](Self::consume) but decodes the bytes as text.
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn consume_line(&mut self, end: usize, skip: usize) -> String {
        String::from_utf8_lossy(self.consume(end, skip)).into_owned()
    }

    /// Keeps only the first `len` pending bytes and un-counts the rest, as
    /// if they had never been appended. Used to give back bytes that belong
    /// to the next pipelined request.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.received -= (self.len - len) as u64;
            self.len = len;
            if self.len == 0 {
                self.start = 0;
            }
        }
    }

    /// Drops every pending byte and zeroes the received counter. The
    /// allocation is kept.
    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
        self.received = 0;
    }

    fn compact(&mut self) {
        if self.start != 0 {
            self.buf.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
    }
}

/// Offset of the first occurrence of `needle` in `haystack`.
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Offset of the last occurrence of `needle` in `haystack`.
pub fn rfind_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
