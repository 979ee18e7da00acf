//! Message buffer pool.
//!
//! Outgoing payload buffers are frozen into `Bytes` while in flight. Once
//! the last holder of a [`QueuedMessage`] lets go, the buffer is reclaimed
//! with `Bytes::try_into_mut` and kept for the next `create_message`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::message::{OutgoingMessage, QueuedMessage};

const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// Counters exposed by [`MessagePool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated because the pool was empty.
    pub allocated: u64,
    /// Buffers handed out from the pool.
    pub reused: u64,
    /// Messages whose recycle count reached zero.
    pub recycled: u64,
    /// Buffers currently waiting in the pool.
    pub pooled: usize,
}

pub struct MessagePool {
    buffers: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
}

impl MessagePool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    pub fn create_message(&self) -> OutgoingMessage {
        OutgoingMessage::from_buffer(self.take_buffer(DEFAULT_BUFFER_CAPACITY))
    }

    pub fn create_message_with_capacity(&self, capacity: usize) -> OutgoingMessage {
        OutgoingMessage::from_buffer(self.take_buffer(capacity))
    }

    pub fn take_buffer(&self, capacity: usize) -> BytesMut {
        let pooled = self.buffers.lock().pop();
        match pooled {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.reserve(capacity);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(capacity)
            }
        }
    }

    /// Drop a holder; the last one returns the buffer to the pool.
    pub fn release(&self, message: Arc<QueuedMessage>) {
        if !message.release_ref() {
            return;
        }
        self.recycled.fetch_add(1, Ordering::Relaxed);
        // Transient clones (frames still being encoded) keep the Arc alive;
        // the buffer is simply left to the allocator then.
        if let Ok(inner) = Arc::try_unwrap(message) {
            self.recycle_bytes(inner.into_payload());
        }
    }

    /// Return a frozen buffer if nothing else references it.
    pub fn recycle_bytes(&self, bytes: Bytes) {
        if let Ok(mut buf) = bytes.try_into_mut() {
            buf.clear();
            let mut buffers = self.buffers.lock();
            if buffers.len() < self.max_pooled {
                buffers.push(buf);
            } else {
                tracing::trace!("message pool full, discarding buffer");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            pooled: self.buffers.lock().len(),
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused() {
        let pool = MessagePool::new(4);
        let mut msg = pool.create_message();
        msg.write(b"hello");
        let queued = Arc::new(QueuedMessage::new(
            1,
            false,
            msg.into_buffer().freeze(),
            1,
        ));
        pool.release(queued);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.pooled, 1);

        let again = pool.create_message();
        assert!(again.is_empty());
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn shared_message_recycled_after_last_holder() {
        let pool = MessagePool::new(4);
        let queued = Arc::new(QueuedMessage::new(1, false, Bytes::from(vec![1, 2, 3]), 2));
        pool.release(queued.clone());
        assert_eq!(pool.stats().recycled, 0);
        pool.release(queued);
        assert_eq!(pool.stats().recycled, 1);
    }

    #[test]
    fn pool_capacity_is_bounded() {
        let pool = MessagePool::new(1);
        pool.recycle_bytes(Bytes::from(vec![0u8; 8]));
        pool.recycle_bytes(Bytes::from(vec![0u8; 8]));
        assert_eq!(pool.stats().pooled, 1);
    }
}
