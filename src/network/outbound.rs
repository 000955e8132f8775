//! Bounded per-connection outbound queue.
//!
//! `send` pushes buffers here and returns; the driver's writer task pops
//! them, frames them and writes to the socket. The queue never grows past
//! its capacity: the overflow policy decides what happens instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What happens when a buffer is pushed onto a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued buffer to make room.
    DropOldest,
    /// Refuse the new buffer.
    DropNewest,
    /// Wait for room, up to `timeout`, then refuse.
    Block {
        /// Longest a sender waits for room.
        #[serde(with = "crate::config::duration_ms")]
        timeout: Duration,
    },
}

/// Why a push failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Queue full and the policy refused the buffer.
    Full,
    /// Queue closed; the connection is going away.
    Closed,
}

/// Bounded FIFO between `send` callers and one writer task.
#[derive(Debug)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
}

impl OutboundQueue {
    /// Create an empty queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            policy,
            closed: AtomicBool::new(false),
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a buffer, applying the overflow policy when full.
    pub async fn push(&self, payload: Bytes) -> Result<(), PushError> {
        let deadline = match self.policy {
            OverflowPolicy::Block { timeout } => Some(tokio::time::Instant::now() + timeout),
            _ => None,
        };

        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            if self.is_closed() {
                return Err(PushError::Closed);
            }

            {
                let mut items = self.items.lock();
                if items.len() < self.capacity {
                    items.push_back(payload);
                    drop(items);
                    self.readable.notify_one();
                    return Ok(());
                }

                match self.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(payload);
                        drop(items);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.readable.notify_one();
                        return Ok(());
                    }
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(PushError::Full);
                    }
                    OverflowPolicy::Block { .. } => {}
                }
            }

            let Some(deadline) = deadline else {
                return Err(PushError::Full);
            };
            if tokio::time::timeout_at(deadline, writable).await.is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(PushError::Full);
            }
        }
    }

    /// Wait for the next buffer. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }

            readable.await;
        }
    }

    /// Take the next buffer without waiting.
    pub fn try_pop(&self) -> Option<Bytes> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.writable.notify_one();
        }
        item
    }

    /// Close the queue: pending buffers are discarded, waiters wake up.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.items.lock().clear();
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffers currently queued.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers evicted or refused by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(4, OverflowPolicy::DropNewest);
        for n in 0..3 {
            queue.push(payload(n)).await.unwrap();
        }
        assert_eq!(queue.pop().await, Some(payload(0)));
        assert_eq!(queue.pop().await, Some(payload(1)));
        assert_eq!(queue.pop().await, Some(payload(2)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_front() {
        let queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(payload(1)).await.unwrap();
        queue.push(payload(2)).await.unwrap();
        queue.push(payload(3)).await.unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(payload(2)));
        assert_eq!(queue.try_pop(), Some(payload(3)));
    }

    #[tokio::test]
    async fn test_drop_newest_refuses() {
        let queue = OutboundQueue::new(1, OverflowPolicy::DropNewest);
        queue.push(payload(1)).await.unwrap();
        assert_eq!(queue.push(payload(2)).await, Err(PushError::Full));
        assert_eq!(queue.try_pop(), Some(payload(1)));
    }

    #[tokio::test]
    async fn test_block_times_out_when_nobody_drains() {
        let queue = OutboundQueue::new(
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_millis(30),
            },
        );
        queue.push(payload(1)).await.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(queue.push(payload(2)).await, Err(PushError::Full));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_block_resumes_when_drained() {
        let queue = Arc::new(OutboundQueue::new(
            1,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(5),
            },
        ));
        queue.push(payload(1)).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(payload(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pop().await, Some(payload(1)));
        assert_eq!(producer.await.unwrap(), Ok(()));
        assert_eq!(queue.pop().await, Some(payload(2)));
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let queue = Arc::new(OutboundQueue::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
        assert_eq!(queue.push(payload(1)).await, Err(PushError::Closed));
    }
}
