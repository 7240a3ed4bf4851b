//! Reusable working buffers for readers and writers.
//!
//! A [`BufferPool`] is an explicit, cloneable handle; there is no global
//! pool. Checking out a buffer yields a [`PooledBuffer`] guard that returns
//! its (cleared) storage to the pool when dropped, whether the operation
//! that used it finished normally or bailed out with an error.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Default number of idle buffers a pool retains.
pub const DEFAULT_MAX_POOLED: usize = 16;

/// Buffers that grew beyond this are released instead of pooled.
pub const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
}

/// A shared pool of byte buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_max_pooled(DEFAULT_MAX_POOLED)
    }

    pub fn with_max_pooled(max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::new()),
                max_pooled,
            }),
        }
    }

    /// Checks out an empty buffer with at least `capacity` bytes reserved.
    pub fn checkout(&self, capacity: usize) -> PooledBuffer {
        let reused = self.inner.buffers.lock().pop();
        let buf = match reused {
            Some(mut buf) => {
                buf.reserve(capacity);
                buf
            }
            None => {
                tracing::trace!(capacity, "buffer pool miss");
                BytesMut::with_capacity(capacity)
            }
        };
        PooledBuffer {
            buf,
            pool: Some(self.clone()),
        }
    }

    /// Number of idle buffers currently held.
    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let mut buffers = self.inner.buffers.lock();
        if buffers.len() < self.inner.max_pooled {
            buffers.push(buf);
        }
    }
}

/// A buffer checked out of a [`BufferPool`], or a detached one.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Option<BufferPool>,
}

impl PooledBuffer {
    /// A buffer that belongs to no pool.
    pub fn detached(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pool: None,
        }
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = BufferPool::new();
        assert_eq!(pool.available(), 0);

        {
            let mut buf = pool.checkout(64);
            buf.put_slice(b"hello");
            assert_eq!(&buf[..], b"hello");
        }
        assert_eq!(pool.available(), 1);

        // The reused buffer comes back empty.
        let buf = pool.checkout(16);
        assert!(buf.is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_buffer_returns_on_error_path() {
        fn fails(pool: &BufferPool) -> Result<(), &'static str> {
            let mut buf = pool.checkout(8);
            buf.put_u8(1);
            Err("boom")
        }

        let pool = BufferPool::new();
        assert!(fails(&pool).is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_pool_retention_is_bounded() {
        let pool = BufferPool::with_max_pooled(2);
        let buffers: Vec<_> = (0..4).map(|_| pool.checkout(8)).collect();
        drop(buffers);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_oversized_buffers_are_released() {
        let pool = BufferPool::new();
        drop(pool.checkout(MAX_POOLED_CAPACITY * 2));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_detached_buffer() {
        let pool = BufferPool::new();
        let mut buf = PooledBuffer::detached(4);
        buf.put_slice(b"abcd");
        drop(buf);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_shared_across_threads() {
        let pool = BufferPool::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut buf = pool.checkout(32);
                    buf.put_slice(&[0u8; 32]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.available() >= 1);
    }
}
