//! Fixed-size pool of read buffers
//!
//! File streaming reads into a bounded set of buffers. A filled buffer is
//! wrapped in a [`PooledBuffer`] and handed out as shared [`Bytes`]; when the
//! last clone of those bytes is dropped, on any thread, the buffer goes back
//! to the pool and the owner is woken up to schedule the next read.

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::event_loop::LoopRemote;

/// A thread-safe pool of equally sized byte buffers
///
/// The pool never allocates past its initial count: once every buffer is
/// checked out, [`try_acquire`](Self::try_acquire) returns `None` until one
/// is released.
///
/// # Examples
///
/// ```rust
/// use horizon_io::buffer_pool::BufferPool;
///
/// let pool = BufferPool::new(2, 4096);
/// let a = pool.try_acquire().unwrap();
/// let _b = pool.try_acquire().unwrap();
/// assert!(pool.try_acquire().is_none());
///
/// pool.release(a);
/// assert_eq!(pool.available_count(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct BufferPool {
    /// Internal storage for available buffers
    buffers: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Size of every buffer in bytes
    buffer_size: usize,
    /// Number of buffers owned by the pool
    total: usize,
}

impl BufferPool {
    /// Creates a pool of `count` zero-filled buffers of `buffer_size` bytes
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let buffers = (0..count).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            buffers: Arc::new(Mutex::new(buffers)),
            buffer_size,
            total: count,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a buffer of full length out of the pool, if one is free
    pub fn try_acquire(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    /// Returns a buffer to the pool
    ///
    /// The buffer is restored to full length; contents are not cleared.
    /// Buffers beyond the pool's capacity are dropped.
    pub fn release(&self, mut buffer: Vec<u8>) {
        let mut buffers = self.lock();
        if buffers.len() < self.total {
            buffer.resize(self.buffer_size, 0);
            buffers.push_back(buffer);
        }
    }

    /// Number of buffers currently available in the pool
    pub fn available_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of buffers currently checked out
    pub fn checked_out(&self) -> usize {
        self.total - self.available_count()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Who to wake when a pooled buffer comes back
#[derive(Clone, Debug)]
pub(crate) struct ReleaseNotifier {
    pub remote: LoopRemote,
    pub wakeup_id: u64,
}

/// Owner of a checked-out buffer backing a `Bytes` handle
pub(crate) struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
    notifier: Option<ReleaseNotifier>,
}

impl PooledBuffer {
    /// Wraps the first `len` bytes of `buf` as shared bytes
    pub fn into_bytes(mut buf: Vec<u8>, len: usize, pool: BufferPool, notifier: Option<ReleaseNotifier>) -> Bytes {
        buf.truncate(len);
        Bytes::from_owner(PooledBuffer { buf, pool, notifier })
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(mem::take(&mut self.buf));
        if let Some(n) = self.notifier.take() {
            n.remote.notify(n.wakeup_id);
        }
    }
}
