//! Fixed-capacity byte window over unparsed connection input.

use std::io;

use reef_common::error::{ReefError, ReefResult};

/// Bytes read from a socket but not yet consumed by the parser.
///
/// The capacity bound doubles as the hard per-read cap and the maximum accepted header length.
/// Consumption shifts the unread remainder to the front internally, so call sites never do
/// offset arithmetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWindow {
    buffer: Vec<u8>,
    capacity: usize,
}

impl ReadWindow {
    /// Creates an empty window bounded to `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Unconsumed bytes in arrival order.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` when no bytes are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns `true` when the capacity bound is reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    /// Remaining room before the capacity bound.
    #[must_use]
    pub fn vacant(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// Buffers `bytes` behind any unconsumed remainder.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::InvalidState` when `bytes` does not fit the remaining capacity.
    pub fn append(&mut self, bytes: &[u8]) -> ReefResult<()> {
        if bytes.len() > self.vacant() {
            return Err(ReefError::InvalidState(
                "read window capacity exceeded",
            ));
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Discards the first `count` buffered bytes, clamped to the buffered length.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.buffer.len());
        let _ = self.buffer.drain(..count);
    }

    /// Reads once from `reader` into the vacant part of the window.
    ///
    /// Returns the number of bytes read; zero means end of stream (the session drains the
    /// window after every read, so a well-behaved caller never reads into a full window).
    ///
    /// # Errors
    ///
    /// Propagates the underlying read error, including `WouldBlock` under non-blocking I/O.
    pub fn read_from<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(self.capacity, 0);
        match reader.read(&mut self.buffer[start..]) {
            Ok(read_len) => {
                self.buffer.truncate(start + read_len);
                Ok(read_len)
            }
            Err(error) => {
                self.buffer.truncate(start);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ReadWindow;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn append_and_consume_shift_the_remainder() {
        let mut window = ReadWindow::with_capacity(16);
        window.append(b"get foo\r\n").expect("append should fit");

        window.consume(4);
        assert_that!(window.bytes(), eq(b"foo\r\n".as_slice()));
        assert_that!(window.len(), eq(5));
    }

    #[rstest]
    fn append_beyond_capacity_is_rejected() {
        let mut window = ReadWindow::with_capacity(4);
        window.append(b"abc").expect("append should fit");

        let result = window.append(b"de");
        assert_that!(result.is_err(), eq(true));
        assert_that!(window.bytes(), eq(b"abc".as_slice()));
    }

    #[rstest]
    fn consume_clamps_to_buffered_length() {
        let mut window = ReadWindow::with_capacity(8);
        window.append(b"ab").expect("append should fit");

        window.consume(100);
        assert_that!(window.is_empty(), eq(true));
    }

    #[rstest]
    fn read_from_fills_only_vacant_capacity() {
        let mut window = ReadWindow::with_capacity(4);
        window.append(b"ab").expect("append should fit");

        let mut source = b"cdef".as_slice();
        let read_len = window
            .read_from(&mut source)
            .expect("read should succeed");
        assert_that!(read_len, eq(2));
        assert_that!(window.bytes(), eq(b"abcd".as_slice()));
        assert_that!(window.is_full(), eq(true));
    }

    #[rstest]
    fn read_from_reports_end_of_stream() {
        let mut window = ReadWindow::with_capacity(4);
        let mut source = b"".as_slice();
        let read_len = window
            .read_from(&mut source)
            .expect("read should succeed");
        assert_that!(read_len, eq(0));
    }
}
