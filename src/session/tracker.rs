//! In-flight operation tracking.
//!
//! Matches acknowledged requests (QoS 1/2 PUBLISH, SUBSCRIBE, UNSUBSCRIBE)
//! to their acknowledgments by packet identifier. Identifiers are the
//! smallest unused nonzero value and are recycled only after the operation
//! completes, times out, or is cancelled. Publish-kind operations survive a
//! connection drop so they can be retransmitted with DUP; subscribe-kind
//! operations do not - a fresh connection needs a fresh exchange.

use crate::error::{SessionError, SessionResult};
use crate::protocol::packet::{Packet, Publish};
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What kind of acknowledgment an operation is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// QoS 1 PUBLISH awaiting PUBACK.
    PublishQos1,
    /// QoS 2 PUBLISH awaiting PUBREC.
    PublishQos2,
    /// QoS 2 PUBREL awaiting PUBCOMP.
    PublishRelease,
    /// SUBSCRIBE awaiting SUBACK.
    Subscribe { filter: String },
    /// UNSUBSCRIBE awaiting UNSUBACK.
    Unsubscribe { filter: String },
}

impl OperationKind {
    /// Publish-kind operations are kept across a connection drop and
    /// retransmitted; everything else is a fresh-exchange-only operation.
    pub fn survives_reconnect(&self) -> bool {
        matches!(
            self,
            OperationKind::PublishQos1 | OperationKind::PublishQos2 | OperationKind::PublishRelease
        )
    }
}

/// One outstanding acknowledged operation.
#[derive(Debug)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub done: oneshot::Sender<SessionResult<()>>,
    /// Retained copy of the PUBLISH for DUP retransmission.
    pub publish: Option<Publish>,
}

#[derive(Debug, Default)]
pub struct OperationTracker {
    inflight: BTreeMap<u16, PendingOperation>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Smallest nonzero identifier not currently in flight.
    fn smallest_free_id(&self) -> Option<u16> {
        let mut candidate: u16 = 1;
        for &id in self.inflight.keys() {
            if id == candidate {
                if candidate == u16::MAX {
                    return None;
                }
                candidate += 1;
            } else {
                break;
            }
        }
        Some(candidate)
    }

    /// Register an operation under a fresh packet identifier.
    ///
    /// On exhaustion (65535 operations outstanding) the operation is handed
    /// back so the caller can fail its handle.
    pub fn register(&mut self, operation: PendingOperation) -> Result<u16, PendingOperation> {
        match self.smallest_free_id() {
            Some(id) => {
                self.inflight.insert(id, operation);
                Ok(id)
            }
            None => Err(operation),
        }
    }

    /// Attach the sent PUBLISH so it can be retransmitted later.
    pub fn attach_publish(&mut self, id: u16, publish: Publish) {
        if let Some(op) = self.inflight.get_mut(&id) {
            op.publish = Some(publish);
        }
    }

    /// Remove and return the operation for an acknowledgment.
    pub fn take(&mut self, id: u16) -> Option<PendingOperation> {
        self.inflight.remove(&id)
    }

    /// Put back an operation removed with [`take`] (kind mismatch path).
    pub fn put_back(&mut self, id: u16, operation: PendingOperation) {
        self.inflight.insert(id, operation);
    }

    pub fn kind_of(&self, id: u16) -> Option<&OperationKind> {
        self.inflight.get(&id).map(|op| &op.kind)
    }

    /// PUBREC received: move a QoS 2 publish into its release phase.
    /// Returns false when the identifier is unknown or in the wrong phase.
    pub fn begin_release(&mut self, id: u16, new_deadline: Instant) -> bool {
        match self.inflight.get_mut(&id) {
            Some(op) if op.kind == OperationKind::PublishQos2 => {
                op.kind = OperationKind::PublishRelease;
                op.deadline = new_deadline;
                // The PUBLISH copy is no longer needed; PUBREL is resent instead.
                op.publish = None;
                true
            }
            _ => false,
        }
    }

    /// Fail and remove every overdue operation.
    ///
    /// While disconnected, publish-kind operations are exempt: they are
    /// waiting for a reconnect and will be retransmitted with refreshed
    /// deadlines. Returns what was removed, for logging.
    pub fn sweep(&mut self, now: Instant, connected: bool) -> Vec<(u16, OperationKind)> {
        let overdue: Vec<u16> = self
            .inflight
            .iter()
            .filter(|(_, op)| now >= op.deadline)
            .filter(|(_, op)| connected || !op.kind.survives_reconnect())
            .map(|(&id, _)| id)
            .collect();

        let mut removed = Vec::with_capacity(overdue.len());
        for id in overdue {
            if let Some(op) = self.inflight.remove(&id) {
                let after = op.deadline.duration_since(op.submitted_at);
                let _ = op.done.send(Err(SessionError::Timeout { after }));
                removed.push((id, op.kind));
            }
        }
        removed
    }

    /// Fail and remove every outstanding operation.
    pub fn cancel_all(&mut self, reason: &str) {
        let inflight = std::mem::take(&mut self.inflight);
        for (_, op) in inflight {
            let _ = op.done.send(Err(SessionError::cancelled(reason)));
        }
    }

    /// Packets to retransmit after a reconnect, ordered by identifier, with
    /// deadlines refreshed. QoS 1/2 publishes go out again with DUP set; a
    /// release-phase QoS 2 operation resends its PUBREL.
    pub fn resendable(&mut self, new_deadline: Instant) -> Vec<Packet> {
        let mut packets = Vec::new();
        for (&id, op) in self.inflight.iter_mut() {
            match &op.kind {
                OperationKind::PublishQos1 | OperationKind::PublishQos2 => {
                    if let Some(publish) = &op.publish {
                        let mut dup = publish.clone();
                        dup.dup = true;
                        op.deadline = new_deadline;
                        packets.push(Packet::Publish(dup));
                    }
                }
                OperationKind::PublishRelease => {
                    op.deadline = new_deadline;
                    packets.push(Packet::PubRel { packet_id: id });
                }
                OperationKind::Subscribe { .. } | OperationKind::Unsubscribe { .. } => {}
            }
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::QoS;
    use bytes::Bytes;
    use std::time::Duration;

    fn operation(kind: OperationKind) -> (PendingOperation, oneshot::Receiver<SessionResult<()>>) {
        let (done, rx) = oneshot::channel();
        let now = Instant::now();
        (
            PendingOperation {
                kind,
                submitted_at: now,
                deadline: now + Duration::from_secs(5),
                done,
                publish: None,
            },
            rx,
        )
    }

    fn publish_packet(id: u16) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "t".to_string(),
            packet_id: Some(id),
            payload: Bytes::from_static(b"p"),
        }
    }

    #[test]
    fn test_smallest_free_id_allocation() {
        let mut tracker = OperationTracker::new();
        let (op1, _r1) = operation(OperationKind::PublishQos1);
        let (op2, _r2) = operation(OperationKind::PublishQos1);
        let (op3, _r3) = operation(OperationKind::PublishQos1);

        assert_eq!(tracker.register(op1).unwrap(), 1);
        assert_eq!(tracker.register(op2).unwrap(), 2);
        assert_eq!(tracker.register(op3).unwrap(), 3);

        // Completing 2 frees the smallest gap; the next allocation reuses it.
        tracker.take(2);
        let (op4, _r4) = operation(OperationKind::PublishQos1);
        assert_eq!(tracker.register(op4).unwrap(), 2);

        let (op5, _r5) = operation(OperationKind::PublishQos1);
        assert_eq!(tracker.register(op5).unwrap(), 4);
    }

    #[test]
    fn test_take_unknown_id_is_none() {
        let mut tracker = OperationTracker::new();
        assert!(tracker.take(42).is_none());
    }

    #[tokio::test]
    async fn test_sweep_times_out_overdue_operations() {
        let mut tracker = OperationTracker::new();
        let (op, rx) = operation(OperationKind::Subscribe {
            filter: "a/+".to_string(),
        });
        let id = tracker.register(op).unwrap();

        // Before the deadline nothing happens.
        assert!(tracker.sweep(Instant::now(), true).is_empty());

        let removed = tracker.sweep(Instant::now() + Duration::from_secs(6), true);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, id);
        assert!(tracker.is_empty());

        match rx.await {
            Ok(Err(SessionError::Timeout { after })) => {
                assert_eq!(after, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_sweep_retains_publishes_while_disconnected() {
        let mut tracker = OperationTracker::new();
        let (publish_op, _r1) = operation(OperationKind::PublishQos1);
        let (subscribe_op, _r2) = operation(OperationKind::Subscribe {
            filter: "x".to_string(),
        });
        tracker.register(publish_op).unwrap();
        tracker.register(subscribe_op).unwrap();

        let late = Instant::now() + Duration::from_secs(60);

        // Disconnected: only the subscribe is failed.
        let removed = tracker.sweep(late, false);
        assert_eq!(removed.len(), 1);
        assert!(matches!(removed[0].1, OperationKind::Subscribe { .. }));
        assert_eq!(tracker.len(), 1);

        // Connected: the publish times out too.
        let removed = tracker.sweep(late, true);
        assert_eq!(removed.len(), 1);
        assert!(matches!(removed[0].1, OperationKind::PublishQos1));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_resendable_sets_dup_and_refreshes_deadlines() {
        let mut tracker = OperationTracker::new();
        let (op, _rx) = operation(OperationKind::PublishQos1);
        let id = tracker.register(op).unwrap();
        tracker.attach_publish(id, publish_packet(id));

        let new_deadline = Instant::now() + Duration::from_secs(30);
        let packets = tracker.resendable(new_deadline);
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Publish(p) => {
                assert!(p.dup, "retransmission must carry DUP");
                assert_eq!(p.packet_id, Some(id));
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }

        // Deadline was pushed out, so an immediate connected sweep keeps it.
        assert!(tracker.sweep(Instant::now() + Duration::from_secs(6), true).is_empty());
    }

    #[test]
    fn test_qos2_release_phase_resends_pubrel() {
        let mut tracker = OperationTracker::new();
        let (op, _rx) = operation(OperationKind::PublishQos2);
        let id = tracker.register(op).unwrap();
        tracker.attach_publish(id, publish_packet(id));

        assert!(tracker.begin_release(id, Instant::now() + Duration::from_secs(5)));
        // Wrong phase now: a second PUBREC must not transition again.
        assert!(!tracker.begin_release(id, Instant::now()));

        let packets = tracker.resendable(Instant::now() + Duration::from_secs(5));
        assert_eq!(packets, vec![Packet::PubRel { packet_id: id }]);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let mut tracker = OperationTracker::new();
        let (op1, r1) = operation(OperationKind::PublishQos1);
        let (op2, r2) = operation(OperationKind::Unsubscribe {
            filter: "f".to_string(),
        });
        tracker.register(op1).unwrap();
        tracker.register(op2).unwrap();

        tracker.cancel_all("session disconnected");
        assert!(tracker.is_empty());

        for rx in [r1, r2] {
            assert!(matches!(
                rx.await,
                Ok(Err(SessionError::Cancelled { .. }))
            ));
        }
    }
}
