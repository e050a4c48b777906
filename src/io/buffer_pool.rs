//! Read buffer pool
//!
//! A small lock-free pool of reusable read buffers, one pool per forwarding
//! direction. Pump loops borrow a buffer for the lifetime of their
//! connection; every consumer downstream of a read receives an
//! independently-owned copy of the bytes, never the pool buffer itself.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Size of each pooled read buffer
pub const READ_BUFFER_SIZE: usize = 4096;

/// Default pool capacity (number of retained buffers)
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Lock-free pool of fixed-size read buffers
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    /// Create a pool retaining up to `capacity` buffers of `buffer_size` bytes
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// Create a pool with the default capacity and 4 KiB buffers
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, READ_BUFFER_SIZE)
    }

    /// Borrow a buffer from the pool, allocating when the pool is empty
    ///
    /// The buffer is returned to the pool when the [`PooledBuffer`] drops.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = if let Some(mut buf) = self.buffers.pop() {
            self.reuses.fetch_add(1, Ordering::Relaxed);
            buf.resize(self.buffer_size, 0);
            buf
        } else {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.buffer_size]
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        // Pool full: let the buffer drop
        let _ = self.buffers.push(buffer);
    }

    /// Size of each buffer in bytes
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently idle in the pool
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Number of fresh allocations so far
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of buffer reuses so far
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }
}

/// A buffer borrowed from a [`BufferPool`]
///
/// Dereferences to `[u8]` of the pool's buffer size; returns to the pool on
/// drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.return_buffer(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_then_reuses() {
        let pool = Arc::new(BufferPool::new(4, 4096));

        let buf = pool.get();
        assert_eq!(buf.len(), 4096);
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.reuses(), 0);

        drop(buf);
        assert_eq!(pool.available(), 1);

        let _buf = pool.get();
        assert_eq!(pool.allocations(), 1);
        assert_eq!(pool.reuses(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_full_pool_drops_returned_buffers() {
        let pool = Arc::new(BufferPool::new(1, 16));
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_buffer_is_writable_full_length() {
        let pool = Arc::new(BufferPool::new(2, 32));
        let mut buf = pool.get();
        buf[0] = 0xff;
        buf[31] = 0x01;
        assert_eq!(buf[0], 0xff);
        assert_eq!(buf[31], 0x01);
    }

    #[test]
    fn test_reused_buffer_has_full_length() {
        let pool = Arc::new(BufferPool::new(2, 32));
        let buf = pool.get();
        drop(buf);
        let buf = pool.get();
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let pool = Arc::new(BufferPool::new(16, 64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.get();
                        buf[0] = 42;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.allocations() + pool.reuses(), 400);
    }
}
