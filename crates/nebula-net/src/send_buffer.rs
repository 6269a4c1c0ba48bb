//! Rotating scratch buffer for serializing outbound packets.
//!
//! Packets are encoded in place into a large shared chunk and then split
//! off as immutable [`Bytes`] views. Every view keeps its part of the chunk
//! alive through reference counting, so handing a packet to several
//! connections never copies it, and encoding a burst of packets costs one
//! allocation instead of one per packet.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};

/// Default size of a backing chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

static CHUNK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_CHUNK_SIZE);

/// Set the chunk size used by per-thread allocators from now on.
///
/// Allocators already in use pick it up at their next rotation.
pub fn set_send_chunk_size(size: usize) {
    CHUNK_SIZE.store(size.max(1), Ordering::Relaxed);
}

/// The chunk size per-thread allocators currently use.
pub fn send_chunk_size() -> usize {
    CHUNK_SIZE.load(Ordering::Relaxed)
}

/// Errors raised by misuse of [`SendBufferAllocator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendBufferError {
    /// `close` was called without a preceding `open`.
    #[error("close called without an open region")]
    NotOpen,

    /// `close` reported more bytes than `open` handed out.
    #[error("closed {used} bytes but only {reserved} were reserved")]
    Overflow {
        /// Bytes reported used.
        used: usize,
        /// Size of the region returned by `open`.
        reserved: usize,
    },
}

/// Carves writable regions out of a rotating backing buffer.
#[derive(Debug)]
pub struct SendBufferAllocator {
    chunk: BytesMut,
    chunk_size: usize,
    reserved: Option<usize>,
}

impl SendBufferAllocator {
    /// Create an allocator whose backing chunks are `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk: BytesMut::zeroed(chunk_size),
            chunk_size,
            reserved: None,
        }
    }

    /// Bytes left in the current chunk.
    pub fn remaining(&self) -> usize {
        self.chunk.len()
    }

    /// Return a writable region of at least `size_hint` bytes.
    ///
    /// Starts a fresh chunk when the current one has less than `size_hint`
    /// left. Views produced by earlier [`close`](Self::close) calls stay
    /// valid either way.
    pub fn open(&mut self, size_hint: usize) -> &mut [u8] {
        if self.chunk.len() < size_hint {
            self.chunk = BytesMut::zeroed(self.chunk_size.max(size_hint));
        }
        self.reserved = Some(self.chunk.len());
        &mut self.chunk[..]
    }

    /// Finalize the open region into an immutable view of `used` bytes.
    pub fn close(&mut self, used: usize) -> Result<Bytes, SendBufferError> {
        let reserved = self.reserved.take().ok_or(SendBufferError::NotOpen)?;
        if used > reserved {
            return Err(SendBufferError::Overflow { used, reserved });
        }
        Ok(self.chunk.split_to(used).freeze())
    }
}

impl Default for SendBufferAllocator {
    fn default() -> Self {
        Self::new(send_chunk_size())
    }
}

thread_local! {
    static SEND_BUFFER: RefCell<SendBufferAllocator> = RefCell::new(SendBufferAllocator::default());
}

/// Run `f` with this thread's allocator.
///
/// A nested call on the same thread gets a one-off allocator rather than
/// the shared one.
pub fn with_send_buffer<R>(f: impl FnOnce(&mut SendBufferAllocator) -> R) -> R {
    SEND_BUFFER.with(|cell| match cell.try_borrow_mut() {
        Ok(mut alloc) => {
            alloc.chunk_size = send_chunk_size();
            f(&mut alloc)
        }
        Err(_) => f(&mut SendBufferAllocator::default()),
    })
}
