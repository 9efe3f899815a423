//! Offline publish queue.
//!
//! FIFO buffer for PUBLISH requests made while the session has no
//! connection. Capacity is governed by the configured policy; order is
//! never changed. The session task drains the queue after reconnect and
//! pushes an interrupted head entry back to the front, giving at-least-once
//! behavior across a flush.

use crate::error::{SessionError, SessionResult};
use crate::protocol::packet::QoS;
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub use crate::config::QueuePolicy;

/// A publish waiting for a connection.
#[derive(Debug)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub enqueued_at: Instant,
    /// Completion side of the caller's delivery handle. Resolved when the
    /// message is flushed (QoS 0) or acknowledged (QoS 1/2), failed when it
    /// is evicted or the session shuts down.
    pub done: oneshot::Sender<SessionResult<()>>,
}

/// Outcome of an enqueue attempt.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Stored.
    Stored,
    /// Stored, after evicting the oldest entry (drop-oldest policy). The
    /// evicted message is returned so its handle can be failed.
    StoredEvicting(QueuedMessage),
    /// Rejected: queue full under the reject-new policy. The message is
    /// handed back untouched.
    Rejected(QueuedMessage),
}

#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueuedMessage>,
    policy: QueuePolicy,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(policy: QueuePolicy, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, honoring the capacity policy.
    pub fn enqueue(&mut self, message: QueuedMessage) -> EnqueueOutcome {
        match self.policy {
            QueuePolicy::Unbounded => {
                self.entries.push_back(message);
                EnqueueOutcome::Stored
            }
            QueuePolicy::BoundedRejectNew => {
                if self.entries.len() >= self.capacity {
                    EnqueueOutcome::Rejected(message)
                } else {
                    self.entries.push_back(message);
                    EnqueueOutcome::Stored
                }
            }
            QueuePolicy::BoundedDropOldest => {
                if self.entries.len() >= self.capacity {
                    // capacity is validated > 0, so front exists here
                    match self.entries.pop_front() {
                        Some(evicted) => {
                            self.entries.push_back(message);
                            EnqueueOutcome::StoredEvicting(evicted)
                        }
                        None => {
                            self.entries.push_back(message);
                            EnqueueOutcome::Stored
                        }
                    }
                } else {
                    self.entries.push_back(message);
                    EnqueueOutcome::Stored
                }
            }
        }
    }

    /// Take the oldest message for flushing.
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Put an unflushed message back at the head, preserving order.
    pub fn requeue_front(&mut self, message: QueuedMessage) {
        self.entries.push_front(message);
    }

    /// Fail every queued message. Used on shutdown.
    pub fn cancel_all(&mut self, reason: &str) {
        for message in self.entries.drain(..) {
            let _ = message.done.send(Err(SessionError::cancelled(reason)));
        }
    }

    /// Topics currently queued, oldest first. For logging and tests.
    pub fn topics(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.topic.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str) -> (QueuedMessage, oneshot::Receiver<SessionResult<()>>) {
        let (done, rx) = oneshot::channel();
        (
            QueuedMessage {
                topic: topic.to_string(),
                payload: Bytes::from_static(b"x"),
                qos: QoS::AtLeastOnce,
                retain: false,
                enqueued_at: Instant::now(),
                done,
            },
            rx,
        )
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut queue = OfflineQueue::new(QueuePolicy::Unbounded, 0);
        let (a, _ra) = message("a");
        let (b, _rb) = message("b");
        let (c, _rc) = message("c");
        queue.enqueue(a);
        queue.enqueue(b);
        queue.enqueue(c);

        assert_eq!(queue.pop().unwrap().topic, "a");
        assert_eq!(queue.pop().unwrap().topic, "b");
        assert_eq!(queue.pop().unwrap().topic, "c");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let mut queue = OfflineQueue::new(QueuePolicy::BoundedDropOldest, 2);
        let (a, _ra) = message("a");
        let (b, _rb) = message("b");
        let (c, _rc) = message("c");

        assert!(matches!(queue.enqueue(a), EnqueueOutcome::Stored));
        assert!(matches!(queue.enqueue(b), EnqueueOutcome::Stored));
        match queue.enqueue(c) {
            EnqueueOutcome::StoredEvicting(evicted) => assert_eq!(evicted.topic, "a"),
            other => panic!("expected eviction, got {other:?}"),
        }

        assert_eq!(queue.topics(), vec!["b", "c"]);
    }

    #[test]
    fn test_reject_new_hands_message_back() {
        let mut queue = OfflineQueue::new(QueuePolicy::BoundedRejectNew, 1);
        let (a, _ra) = message("a");
        let (b, _rb) = message("b");

        assert!(matches!(queue.enqueue(a), EnqueueOutcome::Stored));
        match queue.enqueue(b) {
            EnqueueOutcome::Rejected(rejected) => assert_eq!(rejected.topic, "b"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut queue = OfflineQueue::new(QueuePolicy::Unbounded, 0);
        let (a, _ra) = message("a");
        let (b, _rb) = message("b");
        queue.enqueue(a);
        queue.enqueue(b);

        // Simulate an interrupted flush: the head comes back out front.
        let head = queue.pop().unwrap();
        queue.requeue_front(head);
        assert_eq!(queue.topics(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_handles() {
        let mut queue = OfflineQueue::new(QueuePolicy::Unbounded, 0);
        let (a, ra) = message("a");
        let (b, rb) = message("b");
        queue.enqueue(a);
        queue.enqueue(b);

        queue.cancel_all("session shut down");
        assert!(queue.is_empty());

        for rx in [ra, rb] {
            match rx.await {
                Ok(Err(SessionError::Cancelled { reason })) => {
                    assert_eq!(reason, "session shut down")
                }
                other => panic!("expected cancellation, got {other:?}"),
            }
        }
    }
}
