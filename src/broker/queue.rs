//! Bounded delivery queue for broker subscribers
//!
//! Delivery never blocks the tailer: when a consumer falls behind and the
//! queue fills up, everything queued is evicted and only the newest message
//! is kept. A stale device command is worse than a dropped one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

struct Inner<T> {
    buf: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

/// Bounded multi-producer queue with latest-wins overflow
pub struct MessageQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> MessageQueue<T> {
    /// Create a queue holding at most `capacity` messages
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            inner: Arc::new(Inner {
                buf: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue without blocking; on overflow, evict everything queued and
    /// keep only `item`
    ///
    /// Returns the number of messages evicted.
    pub fn push_latest(&self, item: T) -> usize {
        let evicted = {
            let mut buf = self.inner.buf.lock().expect("queue lock poisoned");
            let evicted = if buf.len() >= self.inner.capacity {
                let n = buf.len();
                buf.clear();
                n
            } else {
                0
            };
            buf.push_back(item);
            evicted
        };

        if evicted > 0 {
            tracing::warn!(evicted, "subscriber queue full, kept newest message only");
        }
        self.inner.notify.notify_one();
        evicted
    }

    /// Dequeue the oldest message, if any
    pub fn try_recv(&self) -> Option<T> {
        self.inner
            .buf
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
    }

    /// Wait for the next message
    pub async fn recv(&self) -> T {
        loop {
            if let Some(item) = self.try_recv() {
                return item;
            }
            // A permit stored by a concurrent push resolves this immediately
            self.inner.notify.notified().await;
        }
    }

    /// Wait for the next message, giving up after `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Number of messages currently queued
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.buf.lock().expect("queue lock poisoned").len()
    }

    /// True when nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
