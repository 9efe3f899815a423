//! Inbound message dispatch.
//!
//! Subscription table (filter -> handler) plus a bounded hand-off queue and
//! a worker task that invokes handlers. The protocol reader never runs user
//! code: deliveries are pushed with `try_send`, and when the queue is full
//! the delivery is dropped with a warning rather than stalling ack
//! processing. Entries are provisional until the SUBACK confirms them, but
//! matching messages are dispatched optimistically either way.

use crate::protocol::packet::QoS;
use crate::protocol::topics::filter_matches;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An inbound PUBLISH delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

/// Per-subscription message handler.
pub type MessageHandler = Arc<dyn Fn(Publication) + Send + Sync>;

struct SubscriptionEntry {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
    confirmed: bool,
}

struct DispatchJob {
    publication: Publication,
    handlers: Vec<MessageHandler>,
}

pub struct Dispatcher {
    entries: Vec<SubscriptionEntry>,
    jobs: mpsc::Sender<DispatchJob>,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    /// `queue_depth` bounds how many undelivered publications may be
    /// waiting on slow handlers before new ones are dropped.
    pub fn new(queue_depth: usize) -> Self {
        let (jobs, mut rx) = mpsc::channel::<DispatchJob>(queue_depth);
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                for handler in &job.handlers {
                    handler(job.publication.clone());
                }
            }
        });
        Self {
            entries: Vec::new(),
            jobs,
            worker,
        }
    }

    /// Register a provisional subscription, replacing any prior entry for
    /// the same filter.
    pub fn insert_provisional(&mut self, filter: String, qos: QoS, handler: MessageHandler) {
        self.entries.retain(|e| e.filter != filter);
        self.entries.push(SubscriptionEntry {
            filter,
            qos,
            handler,
            confirmed: false,
        });
    }

    /// Mark a subscription as broker-confirmed.
    pub fn confirm(&mut self, filter: &str) {
        for entry in &mut self.entries {
            if entry.filter == filter {
                entry.confirmed = true;
            }
        }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.filter != filter);
        before != self.entries.len()
    }

    /// Remove a subscription only if it was never confirmed (failed or
    /// timed-out SUBACK).
    pub fn remove_unconfirmed(&mut self, filter: &str) {
        self.entries
            .retain(|e| e.filter != filter || e.confirmed);
    }

    /// All registered filters with their requested QoS, for replay after a
    /// reconnect.
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .map(|e| (e.filter.clone(), e.qos))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match a publication against the table and hand it to the worker.
    pub fn dispatch(&self, publication: Publication) {
        let handlers: Vec<MessageHandler> = self
            .entries
            .iter()
            .filter(|e| filter_matches(&e.filter, &publication.topic))
            .map(|e| e.handler.clone())
            .collect();

        if handlers.is_empty() {
            debug!(topic = %publication.topic, "inbound message matched no subscription");
            return;
        }

        if let Err(mpsc::error::TrySendError::Full(job)) = self.jobs.try_send(DispatchJob {
            publication,
            handlers,
        }) {
            warn!(
                topic = %job.publication.topic,
                "dispatch queue full, dropping delivery"
            );
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // The worker drains what it has and exits once the channel closes;
        // abort covers the case where the runtime keeps it alive.
        self.worker.abort();
    }
}
