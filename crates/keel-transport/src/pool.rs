//! # Buffer Arena
//!
//! Recycled byte buffers for the receive slot, in-flight fragment batches,
//! and reassembly. After warm-up, renting pops a buffer off the free shelf
//! instead of allocating.
//!
//! A rented buffer is an owned [`PooledBuf`] handle. Dropping the handle
//! returns the storage to the shelf, so every exit path (early return,
//! error, peer teardown) gives the memory back.

use bytes::BytesMut;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Buffers that grew beyond this are released to the allocator instead of
/// being shelved, so one huge reassembly does not pin its memory forever.
pub const MAX_RECYCLED_CAPACITY: usize = 64 * 1024;

// ─── Shelf ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Shelf {
    free: Vec<BytesMut>,
    outstanding: usize,
    allocations: u64,
}

// ─── BufferPool ──────────────────────────────────────────────────────────────

/// Shared arena of byte buffers. Cloning the pool clones the handle, not the
/// buffers.
#[derive(Clone)]
pub struct BufferPool {
    shelf: Arc<Mutex<Shelf>>,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool that keeps at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            shelf: Arc::new(Mutex::new(Shelf {
                free: Vec::with_capacity(capacity),
                ..Shelf::default()
            })),
            capacity,
        }
    }

    fn shelf(&self) -> MutexGuard<'_, Shelf> {
        self.shelf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rent a zero-filled buffer of exactly `len` bytes.
    pub fn rent(&self, len: usize) -> PooledBuf {
        let recycled = {
            let mut shelf = self.shelf();
            shelf.outstanding += 1;
            let buf = shelf.free.pop();
            if buf.is_none() {
                shelf.allocations += 1;
            }
            buf
        };

        let mut buf = recycled.unwrap_or_else(|| {
            trace!(len, "no buffer on shelf: allocating");
            BytesMut::with_capacity(len)
        });
        buf.clear();
        buf.resize(len, 0);

        PooledBuf {
            buf,
            shelf: Arc::clone(&self.shelf),
            capacity: self.capacity,
        }
    }

    /// Rent a buffer holding a copy of `data`.
    pub fn rent_copy(&self, data: &[u8]) -> PooledBuf {
        let mut buf = self.rent(data.len());
        buf.copy_from_slice(data);
        buf
    }

    /// Buffers currently rented and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.shelf().outstanding
    }

    /// Idle buffers waiting on the shelf.
    pub fn idle(&self) -> usize {
        self.shelf().free.len()
    }

    /// Number of times a rent had to allocate fresh storage.
    pub fn allocations(&self) -> u64 {
        self.shelf().allocations
    }

    /// Maximum number of idle buffers kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shelf = self.shelf();
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("idle", &shelf.free.len())
            .field("outstanding", &shelf.outstanding)
            .finish()
    }
}

// ─── PooledBuf ───────────────────────────────────────────────────────────────

/// A buffer rented from a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuf {
    buf: BytesMut,
    shelf: Arc<Mutex<Shelf>>,
    capacity: usize,
}

impl PooledBuf {
    /// Narrow the logical length without reallocating.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Mutable access to the underlying `BytesMut` for `BufMut` encoding.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Copy the contents out into an owned `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.buf.len()).finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();

        let mut shelf = self.shelf.lock().unwrap_or_else(PoisonError::into_inner);
        shelf.outstanding = shelf.outstanding.saturating_sub(1);
        if shelf.free.len() < self.capacity && buf.capacity() <= MAX_RECYCLED_CAPACITY {
            shelf.free.push(buf);
        }
    }
}
