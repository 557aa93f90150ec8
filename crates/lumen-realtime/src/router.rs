//! Broadcast routing and queue delivery.
//!
//! The four routing calls resolve their targets under the registry lock and
//! enqueue. Socket writes only happen in [`RealtimeManager::process_queue`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use metrics::{counter, gauge};
use tracing::{debug, warn};

use crate::ids::{ConnectionId, TopicId, UserId};
use crate::manager::RealtimeManager;
use crate::payload::Payload;
use crate::queue::{DeliveryKind, QueuedMessage};
use crate::socket::ConnectionSocket;
use crate::telemetry;

/// Outcome of one queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages taken off the queue.
    pub messages: usize,
    /// Successful per-connection sends.
    pub delivered: usize,
    /// Sends that failed; those connections are now closed.
    pub failed: usize,
    /// Targets that were removed or closed before the drain reached them.
    pub skipped: usize,
}

impl RealtimeManager {
    /// Queue `payload` for one connection.
    ///
    /// Returns `false`, with no side effects, if the connection is unknown or
    /// closed. `true` means accepted, not delivered.
    pub fn send_to_connection(&self, connection_id: &ConnectionId, payload: Payload) -> bool {
        let deliverable = self.registry.lock().deliverable_socket(connection_id).is_some();
        if !deliverable {
            return false;
        }
        self.enqueue(DeliveryKind::Connection, vec![connection_id.clone()], payload);
        true
    }

    /// Queue `payload` for every connection of every listed user.
    /// Returns the number of connections targeted.
    pub fn broadcast_to_users(&self, user_ids: &[UserId], payload: Payload) -> usize {
        let targets = self.registry.lock().user_targets(user_ids);
        self.enqueue(DeliveryKind::Users, targets, payload)
    }

    /// Queue `payload` for every subscriber of `topic_id` not owned by an
    /// excluded user. Returns the number of connections targeted.
    pub fn broadcast_to_topic(
        &self,
        topic_id: &TopicId,
        payload: Payload,
        exclude_users: &[UserId],
    ) -> usize {
        let targets = self.registry.lock().topic_targets(topic_id, exclude_users);
        let recipients = self.enqueue(DeliveryKind::Topic, targets, payload);
        debug!(topic_id = %topic_id, recipients, "broadcast to topic");
        recipients
    }

    /// Queue `payload` for every connection not owned by an excluded user.
    /// Returns the number of connections targeted.
    pub fn broadcast_to_all(&self, payload: Payload, exclude_users: &[UserId]) -> usize {
        let targets = self.registry.lock().all_targets(exclude_users);
        self.enqueue(DeliveryKind::All, targets, payload)
    }

    /// Push one message unless it has no targets. Returns the target count.
    fn enqueue(&self, kind: DeliveryKind, targets: Vec<ConnectionId>, payload: Payload) -> usize {
        let recipients = targets.len();
        if recipients == 0 || self.is_shutting_down() {
            return 0;
        }
        let (dropped, pending) = {
            let mut queue = self.queue.lock();
            let dropped = queue.push(QueuedMessage::new(kind, targets, payload));
            (dropped, queue.len())
        };
        counter!(telemetry::MESSAGES_ENQUEUED_TOTAL, "kind" => kind.as_str()).increment(1);
        set_queue_gauge(pending);
        if dropped > 0 {
            counter!(telemetry::QUEUE_DROPPED_TOTAL).increment(dropped as u64);
            debug!(dropped, capacity = self.config.max_queue_size, "queue full, dropped oldest messages");
        }
        recipients
    }

    /// Deliver up to `batch_size` queued messages, oldest first.
    ///
    /// Sends for one message run concurrently. A failed send marks the
    /// connection closed; the cleanup sweeper removes it later.
    pub async fn process_queue(&self) -> DrainReport {
        let batch = {
            let mut queue = self.queue.lock();
            let batch = queue.take_batch(self.config.batch_size);
            set_queue_gauge(queue.len());
            batch
        };
        let mut report = DrainReport::default();
        for message in batch {
            report.messages += 1;
            let sockets: Vec<(ConnectionId, Arc<dyn ConnectionSocket>)> = {
                let registry = self.registry.lock();
                message
                    .targets
                    .iter()
                    .filter_map(|id| registry.deliverable_socket(id).map(|s| (id.clone(), s)))
                    .collect()
            };
            report.skipped += message.targets.len() - sockets.len();

            let payload = &message.payload;
            let results = join_all(sockets.iter().map(|(_, socket)| socket.send(payload))).await;

            let mut failed = Vec::new();
            for ((id, _), result) in sockets.into_iter().zip(results) {
                match result {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(conn_id = %id, kind = %message.kind, error = %e, "delivery failed, closing connection");
                        failed.push(id);
                    }
                }
            }
            if !failed.is_empty() {
                report.failed += failed.len();
                let mut registry = self.registry.lock();
                for id in &failed {
                    if let Some(conn) = registry.get_mut(id) {
                        let _ = conn.mark_closed();
                    }
                }
            }
        }

        if report.messages > 0 {
            let _ = self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
            let _ = self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
            counter!(telemetry::DELIVERIES_TOTAL).increment(report.delivered as u64);
            counter!(telemetry::DELIVERY_FAILURES_TOTAL).increment(report.failed as u64);
            debug!(
                messages = report.messages,
                delivered = report.delivered,
                failed = report.failed,
                skipped = report.skipped,
                "drained outbound queue"
            );
        }
        report
    }
}

#[allow(clippy::cast_precision_loss)]
fn set_queue_gauge(pending: usize) {
    gauge!(telemetry::QUEUE_LENGTH).set(pending as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::connection::ConnectionState;
    use crate::socket::testing::RecordingSocket;

    fn cid(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn manager_with(config: RealtimeConfig) -> Arc<RealtimeManager> {
        RealtimeManager::new(config).unwrap()
    }

    /// C1(U1, T1), C2(U1, T2), C3(U2, T1)
    fn scenario() -> (Arc<RealtimeManager>, [Arc<RecordingSocket>; 3]) {
        let mgr = manager_with(RealtimeConfig::default());
        let sockets = [RecordingSocket::new(), RecordingSocket::new(), RecordingSocket::new()];
        let layout = [("c1", "u1", "t1"), ("c2", "u1", "t2"), ("c3", "u2", "t1")];
        for ((id, user, topic), socket) in layout.into_iter().zip(&sockets) {
            mgr.add_connection(cid(id), user.into(), socket.clone(), Some(topic.into()))
                .unwrap();
        }
        (mgr, sockets)
    }

    #[tokio::test]
    async fn topic_broadcast_with_exclusion() {
        let (mgr, [s1, s2, s3]) = scenario();
        let targeted = mgr.broadcast_to_topic(&"t1".into(), Payload::from("P"), &["u1".into()]);
        assert_eq!(targeted, 1);

        let report = mgr.process_queue().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(s3.sent_text(), vec!["P"]);
        assert!(s1.sent_text().is_empty());
        assert!(s2.sent_text().is_empty());
    }

    #[tokio::test]
    async fn remove_then_user_broadcast_skips_removed() {
        let (mgr, [s1, s2, _s3]) = scenario();
        assert!(mgr.remove_connection(&cid("c1")));
        assert_eq!(mgr.get_stats().total_connections, 2);
        assert_eq!(mgr.broadcast_to_users(&["u1".into()], Payload::from("Q")), 1);

        let _ = mgr.process_queue().await;
        assert_eq!(s2.sent_text(), vec!["Q"]);
        assert!(s1.sent_text().is_empty());
        assert_eq!(mgr.get_stats().topic_connections.get(&TopicId::from("t1")), Some(&1));
    }

    #[tokio::test]
    async fn broadcast_to_users_counts_each_connection_once() {
        let (mgr, [s1, s2, s3]) = scenario();
        let targeted = mgr.broadcast_to_users(&["u1".into(), "u1".into(), "u2".into()], Payload::from("x"));
        assert_eq!(targeted, 3);
        let _ = mgr.process_queue().await;
        for socket in [s1, s2, s3] {
            assert_eq!(socket.sent_text(), vec!["x"]);
        }
    }

    #[tokio::test]
    async fn broadcast_to_all_applies_exclusions() {
        let (mgr, [s1, s2, s3]) = scenario();
        assert_eq!(mgr.broadcast_to_all(Payload::from("all"), &["u2".into()]), 2);
        let _ = mgr.process_queue().await;
        assert_eq!(s1.sent_text(), vec!["all"]);
        assert_eq!(s2.sent_text(), vec!["all"]);
        assert!(s3.sent_text().is_empty());
    }

    #[tokio::test]
    async fn empty_target_set_enqueues_nothing() {
        let (mgr, _) = scenario();
        assert_eq!(mgr.broadcast_to_topic(&"nobody".into(), Payload::from("x"), &[]), 0);
        assert_eq!(mgr.broadcast_to_users(&["ghost".into()], Payload::from("x")), 0);
        assert_eq!(mgr.queue_len(), 0);
    }

    #[tokio::test]
    async fn send_to_unknown_connection_is_false() {
        let (mgr, _) = scenario();
        assert!(!mgr.send_to_connection(&cid("ghost"), Payload::from("x")));
        assert_eq!(mgr.queue_len(), 0);
    }

    #[tokio::test]
    async fn send_to_connection_is_accepted_then_delivered() {
        let (mgr, [s1, s2, _]) = scenario();
        assert!(mgr.send_to_connection(&cid("c1"), Payload::from("hi")));
        assert_eq!(mgr.queue_len(), 1);
        let _ = mgr.process_queue().await;
        assert_eq!(s1.sent_text(), vec!["hi"]);
        assert!(s2.sent_text().is_empty());
    }

    #[tokio::test]
    async fn full_queue_keeps_newest_messages() {
        let mgr = manager_with(RealtimeConfig {
            max_queue_size: 2,
            ..RealtimeConfig::default()
        });
        let socket = RecordingSocket::new();
        mgr.add_connection(cid("c1"), "u1".into(), socket.clone(), None)
            .unwrap();
        for text in ["m1", "m2", "m3"] {
            assert!(mgr.send_to_connection(&cid("c1"), Payload::from(text)));
        }
        assert_eq!(mgr.queue_len(), 2);
        assert_eq!(mgr.get_stats().dropped_messages, 1);

        let report = mgr.process_queue().await;
        assert_eq!(report.messages, 2);
        assert_eq!(socket.sent_text(), vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn drain_respects_batch_size_and_fifo() {
        let mgr = manager_with(RealtimeConfig {
            batch_size: 2,
            ..RealtimeConfig::default()
        });
        let socket = RecordingSocket::new();
        mgr.add_connection(cid("c1"), "u1".into(), socket.clone(), None)
            .unwrap();
        for text in ["a", "b", "c"] {
            let _ = mgr.send_to_connection(&cid("c1"), Payload::from(text));
        }
        assert_eq!(mgr.process_queue().await.messages, 2);
        assert_eq!(socket.sent_text(), vec!["a", "b"]);
        assert_eq!(mgr.process_queue().await.messages, 1);
        assert_eq!(socket.sent_text(), vec!["a", "b", "c"]);
        assert_eq!(mgr.process_queue().await, DrainReport::default());
    }

    #[tokio::test]
    async fn failed_send_marks_connection_closed() {
        let mgr = manager_with(RealtimeConfig::default());
        let good = RecordingSocket::new();
        mgr.add_connection(cid("good"), "u1".into(), good.clone(), Some("t".into()))
            .unwrap();
        mgr.add_connection(cid("bad"), "u2".into(), RecordingSocket::failing(), Some("t".into()))
            .unwrap();

        assert_eq!(mgr.broadcast_to_topic(&"t".into(), Payload::from("x"), &[]), 2);
        let report = mgr.process_queue().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(good.sent_text(), vec!["x"]);
        assert_eq!(
            mgr.connection_info(&cid("bad")).unwrap().state,
            ConnectionState::Closed
        );

        // Closed connections are no longer targeted
        assert!(!mgr.send_to_connection(&cid("bad"), Payload::from("y")));
        assert_eq!(mgr.broadcast_to_topic(&"t".into(), Payload::from("y"), &[]), 1);

        let stats = mgr.get_stats();
        assert_eq!(stats.delivered_messages, 1);
        assert_eq!(stats.failed_deliveries, 1);
        assert_eq!(stats.closed_connections, 1);
    }

    #[tokio::test]
    async fn target_removed_before_drain_is_skipped() {
        let (mgr, [s1, _, s3]) = scenario();
        assert_eq!(mgr.broadcast_to_topic(&"t1".into(), Payload::from("late"), &[]), 2);
        assert!(mgr.remove_connection(&cid("c3")));
        let report = mgr.process_queue().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(s1.sent_text(), vec!["late"]);
        assert!(s3.sent_text().is_empty());
    }

    #[tokio::test]
    async fn targets_resolved_at_enqueue_time() {
        let (mgr, [_, s2, _]) = scenario();
        assert_eq!(mgr.broadcast_to_topic(&"t1".into(), Payload::from("early"), &[]), 2);
        // Subscribing after the broadcast does not widen it
        assert!(mgr.subscribe_to_topic(&cid("c2"), "t1".into()));
        let _ = mgr.process_queue().await;
        assert!(s2.sent_text().is_empty());
    }

    #[tokio::test]
    async fn json_payloads_are_delivered_verbatim() {
        let (mgr, [s1, _, _]) = scenario();
        let payload = Payload::json(&serde_json::json!({"type": "progress", "pct": 40})).unwrap();
        assert!(mgr.send_to_connection(&cid("c1"), payload));
        let _ = mgr.process_queue().await;
        let sent: serde_json::Value = serde_json::from_str(&s1.sent_text()[0]).unwrap();
        assert_eq!(sent["pct"], 40);
    }
}
