//! Receive-side byte buffer with independent read and write cursors.
//!
//! ```text
//! 0           read            write              capacity
//! +-------------+---------------+-------------------+
//! |  consumed   |    unread     |    free space     |
//! +-------------+---------------+-------------------+
//! ```
//!
//! The socket writes into [`ReceiveCursor::write_view`], the protocol layer
//! reads from [`ReceiveCursor::read_view`]. [`ReceiveCursor::compact`] runs
//! before every receive and keeps trailing free space available, either by
//! sliding the unread bytes down to offset 0 or by growing the buffer.

/// Errors raised when a cursor is advanced past its bounds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    /// More bytes were reported written than there is free space.
    #[error("write of {requested} bytes exceeds free space {free}")]
    WriteOverflow {
        /// Bytes reported written.
        requested: usize,
        /// Free trailing space at the time of the call.
        free: usize,
    },

    /// More bytes were reported read than are unread.
    #[error("read of {requested} bytes exceeds unread size {unread}")]
    ReadOverflow {
        /// Bytes reported read.
        requested: usize,
        /// Unread bytes at the time of the call.
        unread: usize,
    },
}

/// Fixed-capacity receive buffer. Invariant: `read <= write <= capacity`.
#[derive(Debug)]
pub struct ReceiveCursor {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
}

impl ReceiveCursor {
    /// Create a cursor with `capacity` bytes of backing storage.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    /// Total size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of unread bytes.
    pub fn readable(&self) -> usize {
        self.write - self.read
    }

    /// Free space after the write cursor.
    pub fn free(&self) -> usize {
        self.buf.len() - self.write
    }

    /// Region the next receive should fill.
    pub fn write_view(&mut self) -> &mut [u8] {
        &mut self.buf[self.write..]
    }

    /// Contiguous unread region.
    pub fn read_view(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// Record that `n` bytes were written into [`Self::write_view`].
    pub fn on_write(&mut self, n: usize) -> Result<(), CursorError> {
        if n > self.free() {
            return Err(CursorError::WriteOverflow {
                requested: n,
                free: self.free(),
            });
        }
        self.write += n;
        Ok(())
    }

    /// Record that `n` bytes of [`Self::read_view`] were consumed.
    pub fn on_read(&mut self, n: usize) -> Result<(), CursorError> {
        if n > self.readable() {
            return Err(CursorError::ReadOverflow {
                requested: n,
                unread: self.readable(),
            });
        }
        self.read += n;
        Ok(())
    }

    /// Prepare for the next receive so at least `min_free` bytes are free.
    ///
    /// A fully drained buffer resets both cursors to 0. Otherwise unread
    /// bytes are moved to offset 0 when trailing space is short, and the
    /// buffer grows if that still is not enough (a partial frame larger
    /// than the current capacity).
    pub fn compact(&mut self, min_free: usize) {
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        } else if self.free() < min_free && self.read > 0 {
            let unread = self.readable();
            self.buf.copy_within(self.read..self.write, 0);
            self.read = 0;
            self.write = unread;
        }

        if self.free() < min_free {
            let needed = self.write + min_free;
            let new_capacity = needed.max(self.buf.len() * 2);
            let mut grown = vec![0u8; new_capacity].into_boxed_slice();
            grown[..self.write - self.read].copy_from_slice(&self.buf[self.read..self.write]);
            self.write -= self.read;
            self.read = 0;
            self.buf = grown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(cursor: &mut ReceiveCursor, data: &[u8]) {
        cursor.write_view()[..data.len()].copy_from_slice(data);
        cursor.on_write(data.len()).unwrap();
    }

    #[test]
    fn test_new_cursor_is_empty() {
        let cursor = ReceiveCursor::new(16);
        assert_eq!(cursor.capacity(), 16);
        assert_eq!(cursor.readable(), 0);
        assert_eq!(cursor.free(), 16);
        assert!(cursor.read_view().is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let mut cursor = ReceiveCursor::new(16);
        fill(&mut cursor, b"hello");
        assert_eq!(cursor.read_view(), b"hello");

        cursor.on_read(2).unwrap();
        assert_eq!(cursor.read_view(), b"llo");
        assert_eq!(cursor.free(), 11);
    }

    #[test]
    fn test_zero_length_advance_is_noop() {
        let mut cursor = ReceiveCursor::new(8);
        cursor.on_write(0).unwrap();
        cursor.on_read(0).unwrap();
        assert_eq!(cursor.readable(), 0);
        assert_eq!(cursor.free(), 8);
    }

    #[test]
    fn test_write_past_capacity_rejected() {
        let mut cursor = ReceiveCursor::new(4);
        let err = cursor.on_write(5).unwrap_err();
        assert_eq!(
            err,
            CursorError::WriteOverflow {
                requested: 5,
                free: 4
            }
        );
        assert_eq!(cursor.readable(), 0);
    }

    #[test]
    fn test_read_past_unread_rejected() {
        let mut cursor = ReceiveCursor::new(8);
        fill(&mut cursor, b"abc");
        assert!(matches!(
            cursor.on_read(4),
            Err(CursorError::ReadOverflow {
                requested: 4,
                unread: 3
            })
        ));
        assert_eq!(cursor.read_view(), b"abc");
    }

    #[test]
    fn test_compact_resets_when_drained() {
        let mut cursor = ReceiveCursor::new(8);
        fill(&mut cursor, b"abcdef");
        cursor.on_read(6).unwrap();
        assert_eq!(cursor.free(), 2);

        cursor.compact(1);
        assert_eq!(cursor.free(), 8);
        assert_eq!(cursor.capacity(), 8);
    }

    #[test]
    fn test_compact_moves_unread_to_front() {
        let mut cursor = ReceiveCursor::new(8);
        fill(&mut cursor, b"abcdef");
        cursor.on_read(4).unwrap();

        cursor.compact(4);
        assert_eq!(cursor.read_view(), b"ef");
        assert_eq!(cursor.free(), 6);
        assert_eq!(cursor.capacity(), 8);
    }

    #[test]
    fn test_compact_leaves_buffer_alone_with_enough_room() {
        let mut cursor = ReceiveCursor::new(16);
        fill(&mut cursor, b"abcd");
        cursor.on_read(1).unwrap();

        cursor.compact(4);
        assert_eq!(cursor.read_view(), b"bcd");
        assert_eq!(cursor.free(), 12);
    }

    #[test]
    fn test_compact_grows_when_full_of_unread() {
        let mut cursor = ReceiveCursor::new(4);
        fill(&mut cursor, b"wxyz");

        cursor.compact(1);
        assert!(cursor.capacity() >= 5);
        assert_eq!(cursor.read_view(), b"wxyz");
        assert!(cursor.free() >= 1);

        fill(&mut cursor, b"!");
        assert_eq!(cursor.read_view(), b"wxyz!");
    }
}
