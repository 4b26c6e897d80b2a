//! Reusable fixed-capacity byte buffers for the response relay.
//!
//! The relay coalesces many small upstream frames into one outbound chunk. Each chunk
//! needs a scratch buffer; recycling them through a lock-free free list keeps the
//! hot path from allocating a fresh 32 KiB vector per flush.
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_POOL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    free: ArrayQueue<BytesMut>,
}

impl BufferPool {
    /// `capacity` bounds how many idle buffers are retained, not how many can be handed out.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Take a cleared buffer, reusing an idle one when available.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    fn put(&self, mut buf: BytesMut) {
        // A buffer whose storage was split off or shrunk is not worth keeping.
        if buf.capacity() < self.buffer_size {
            return;
        }
        buf.clear();
        // Full pool: the buffer is simply dropped.
        let _ = self.free.push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }
}

/// A buffer checked out of a [`BufferPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Bytes that can still be appended before the buffer reaches its nominal size.
    pub fn remaining(&self) -> usize {
        self.pool.buffer_size.saturating_sub(self.len())
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Copy the buffered bytes out and clear the buffer so it can keep accumulating.
    pub fn take_bytes(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(&self[..]);
        self.clear();
        out
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // `buf` is only `None` inside `drop`.
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
