//! Bounded intent queue with a drop policy
//!
//! Pending swaps are only worth evaluating while they are fresh. Under a
//! burst, the listener keeps the newest intents and drops the oldest
//! unevaluated ones instead of letting latency grow without bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::DropPolicy;

/// What happened to an item handed to `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queued after evicting the oldest item
    EvictedOldest,
    /// The incoming item was discarded
    Rejected,
    Closed,
}

/// Bounded single-consumer channel with backpressure handling
pub struct BackpressureChannel<T> {
    capacity: usize,
    drop_policy: DropPolicy,
    buffer: Mutex<VecDeque<T>>,
    notify: Notify,
    dropped_count: AtomicU64,
    closed: AtomicBool,
}

impl<T: Send> BackpressureChannel<T> {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            drop_policy,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue without waiting; a full queue applies the drop policy
    pub fn send(&self, item: T) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }

        let outcome = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());

            if buffer.len() >= self.capacity {
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
                match self.drop_policy {
                    DropPolicy::DropOldest => {
                        buffer.pop_front();
                        buffer.push_back(item);
                        debug!("Dropped oldest intent due to backpressure");
                        SendOutcome::EvictedOldest
                    }
                    DropPolicy::DropNewest => {
                        debug!("Dropped newest intent due to backpressure");
                        return SendOutcome::Rejected;
                    }
                }
            } else {
                buffer.push_back(item);
                SendOutcome::Queued
            }
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next item; `None` once closed and drained
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            // A notify issued before this point leaves a permit behind
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Stop accepting items; the consumer still drains what is queued
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let channel = BackpressureChannel::new(3, DropPolicy::DropOldest);

        assert_eq!(channel.send(1), SendOutcome::Queued);
        channel.send(2);
        channel.send(3);
        assert_eq!(channel.send(4), SendOutcome::EvictedOldest);

        assert_eq!(channel.len(), 3);
        assert_eq!(channel.dropped_count(), 1);
        assert_eq!(channel.recv().await, Some(2));
        assert_eq!(channel.recv().await, Some(3));
        assert_eq!(channel.recv().await, Some(4));
    }

    #[tokio::test]
    async fn test_drop_newest() {
        let channel = BackpressureChannel::new(2, DropPolicy::DropNewest);

        channel.send(1);
        channel.send(2);
        assert_eq!(channel.send(3), SendOutcome::Rejected);

        assert_eq!(channel.len(), 2);
        assert_eq!(channel.dropped_count(), 1);
        assert_eq!(channel.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let channel = BackpressureChannel::new(4, DropPolicy::DropOldest);
        channel.send("a");
        channel.close();

        assert_eq!(channel.send("b"), SendOutcome::Closed);
        assert_eq!(channel.recv().await, Some("a"));
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let channel = Arc::new(BackpressureChannel::new(4, DropPolicy::DropOldest));
        let consumer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv().await })
        };

        tokio::task::yield_now().await;
        channel.send(7u32);

        assert_eq!(consumer.await.unwrap(), Some(7));
    }
}
