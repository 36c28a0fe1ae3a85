//! Reusable byte buffers shared by all sessions of one publisher or subscriber.
//!
//! # Design
//!
//! - [`BufferPool::allocate`] hands out a [`PooledBuffer`], reusing a free
//!   allocation when one exists.
//! - [`PooledBuffer::share`] freezes a filled buffer into a [`SharedBuffer`]
//!   (`Arc<PooledBuffer>`). The same shared buffer is handed to every
//!   outbound session of a fan-out send, so holders only ever see `&[u8]`.
//! - When the last reference drops, the storage goes back to the free list.
//!   Buffers only hold a `Weak` to the pool, so they can outlive it.
//!
//! The pool is unbounded: allocation never blocks and never fails.
//!
//! # Usage
//!
//! ```
//! use tcp_pubsub::BufferPool;
//!
//! let pool = BufferPool::new();
//! let mut buf = pool.allocate();
//! buf.resize_for(5);
//! buf.copy_from_slice(b"hello");
//! let shared = buf.share();
//! assert_eq!(&shared[..], b"hello");
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Growth slack applied when a buffer has to reallocate.
const GROWTH_FACTOR: f64 = 1.1;

/// A buffer that has been handed off and is now read-only.
pub type SharedBuffer = Arc<PooledBuffer>;

struct PoolInner {
    /// Released storage waiting for reuse.
    free: Mutex<Vec<Vec<u8>>>,
    /// Number of allocations ever created by this pool.
    created: AtomicUsize,
}

/// Reference-counted pool of growable byte buffers.
///
/// Cloning the pool is cheap; all clones share one free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Get a buffer with length 0, reused if one is free.
    pub fn allocate(&self) -> PooledBuffer {
        let reused = self.inner.free.lock().pop();
        let data = match reused {
            Some(data) => data,
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };

        PooledBuffer {
            data,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Buffers currently sitting in the free list.
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Allocations created so far (reuses are not counted).
    pub fn created_count(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("free", &self.free_count())
            .field("created", &self.created_count())
            .finish()
    }
}

/// A byte buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    /// Resize to exactly `len` bytes, growing capacity with some slack first
    /// so that slightly larger messages later do not reallocate again.
    ///
    /// Newly exposed bytes are zeroed.
    pub fn resize_for(&mut self, len: usize) {
        if self.data.capacity() < len {
            let target = ((len as f64) * GROWTH_FACTOR) as usize;
            let target = target.max(len);
            self.data.reserve_exact(target - self.data.len());
        }
        self.data.resize(len, 0);
    }

    /// Current capacity of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Freeze the buffer for handoff.
    pub fn share(self) -> SharedBuffer {
        Arc::new(self)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut data = std::mem::take(&mut self.data);
            data.clear();
            pool.free.lock().push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = BufferPool::new();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.created_count(), 0);
    }

    #[test]
    fn test_allocate_returns_empty_buffer() {
        let pool = BufferPool::new();
        let buf = pool.allocate();
        assert!(buf.is_empty());
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let pool = BufferPool::new();

        let mut buf = pool.allocate();
        buf.resize_for(128);
        let ptr = buf.as_ptr();
        drop(buf);
        assert_eq!(pool.free_count(), 1);

        let mut buf = pool.allocate();
        assert!(buf.is_empty(), "reused buffer must come back cleared");
        assert!(buf.capacity() >= 128, "reused buffer keeps its capacity");
        assert_eq!(pool.created_count(), 1);
        assert_eq!(pool.free_count(), 0);

        buf.resize_for(16);
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn test_growth_has_slack() {
        let pool = BufferPool::new();
        let mut buf = pool.allocate();
        buf.resize_for(1000);
        assert_eq!(buf.len(), 1000);
        assert!(buf.capacity() >= 1100);

        // Within slack: no reallocation.
        let ptr = buf.as_ptr();
        buf.resize_for(1050);
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn test_shared_buffer_returns_after_last_reference() {
        let pool = BufferPool::new();
        let mut buf = pool.allocate();
        buf.resize_for(3);
        buf.copy_from_slice(b"abc");

        let shared = buf.share();
        let a = shared.clone();
        let b = shared.clone();
        drop(shared);
        drop(a);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(&b[..], b"abc");

        drop(b);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool = BufferPool::new();
        let mut buf = pool.allocate();
        buf.resize_for(8);
        drop(pool);
        // Pool gone: dropping the buffer just frees it.
        drop(buf);
    }

    #[test]
    fn test_clones_share_free_list() {
        let pool = BufferPool::new();
        let other = pool.clone();
        drop(pool.allocate());
        assert_eq!(other.free_count(), 1);
    }
}
