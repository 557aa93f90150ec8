//! The realtime manager: registry ownership, lifecycle, and background tasks.
//!
//! Routing lives in [`crate::router`], liveness in [`crate::heartbeat`] and
//! [`crate::cleanup`], derived numbers in [`crate::stats`]; all of them are
//! `impl RealtimeManager` blocks over the state declared here.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::connection::{Connection, ConnectionSnapshot};
use crate::errors::{RealtimeError, Result};
use crate::ids::{ConnectionId, TopicId, UserId};
use crate::queue::OutboundQueue;
use crate::registry::Registry;
use crate::shutdown::ShutdownCoordinator;
use crate::socket::ConnectionSocket;
use crate::telemetry;

/// How long `shutdown` waits for background tasks before aborting them.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracks live connections and fans payloads out to them.
///
/// Constructed once per process and shared as `Arc<RealtimeManager>`.
/// Every public operation is synchronous except the ones that perform socket
/// I/O (`process_queue`, `check_heartbeats`, `shutdown`).
pub struct RealtimeManager {
    pub(crate) config: RealtimeConfig,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) queue: Mutex<OutboundQueue>,
    pub(crate) delivered: AtomicU64,
    pub(crate) failed: AtomicU64,
    shutdown: ShutdownCoordinator,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeManager {
    /// Create a manager. Background tasks are not running until [`start`](Self::start).
    pub fn new(config: RealtimeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let queue = OutboundQueue::new(config.max_queue_size);
        Ok(Arc::new(Self {
            config,
            registry: Mutex::new(Registry::new()),
            queue: Mutex::new(queue),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            shutdown: ShutdownCoordinator::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Active configuration.
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Spawn the queue drain, heartbeat and cleanup tasks.
    ///
    /// Calling this twice, or after shutdown, does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.is_shutting_down() {
            return;
        }
        tasks.push(self.spawn_periodic(
            "queue_drain",
            self.config.queue_process_interval,
            |manager| async move {
                let _ = manager.process_queue().await;
            },
        ));
        tasks.push(self.spawn_periodic(
            "heartbeat",
            self.config.heartbeat_interval,
            |manager| async move {
                let _ = manager.check_heartbeats().await;
            },
        ));
        tasks.push(self.spawn_periodic(
            "cleanup",
            self.config.cleanup_interval,
            |manager| async move {
                let _ = manager.cleanup_inactive_connections();
            },
        ));
        info!(
            heartbeat_ms = duration_ms(self.config.heartbeat_interval),
            drain_ms = duration_ms(self.config.queue_process_interval),
            cleanup_ms = duration_ms(self.config.cleanup_interval),
            "realtime manager started"
        );
    }

    /// Run `tick` every `period` until shutdown or until the manager is dropped.
    ///
    /// The task only holds a `Weak` reference between ticks.
    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        let cancel = self.shutdown.token();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = cancel.cancelled() => break,
                }
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                tick(manager).await;
            }
            debug!(task = name, "realtime task stopped");
        })
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Register a connection, optionally subscribed to one topic.
    ///
    /// The connection is targetable by broadcasts as soon as this returns.
    pub fn add_connection(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        socket: Arc<dyn ConnectionSocket>,
        topic_id: Option<TopicId>,
    ) -> Result<()> {
        let total = {
            let mut registry = self.registry.lock();
            // Checked under the lock: `shutdown` cancels first, then drains
            // through this same lock.
            if self.is_shutting_down() {
                return Err(RealtimeError::ShuttingDown);
            }
            registry.insert(
                connection_id.clone(),
                user_id.clone(),
                socket,
                topic_id.clone(),
                Instant::now(),
            )?;
            registry.len()
        };
        counter!(telemetry::CONNECTIONS_TOTAL).increment(1);
        set_active_gauge(total);
        info!(
            conn_id = %connection_id,
            user_id = %user_id,
            topic_id = topic_id.as_ref().map(TopicId::as_str),
            "connection registered"
        );
        Ok(())
    }

    /// Remove a connection and close its socket. Returns whether it existed.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> bool {
        let (removed, total) = {
            let mut registry = self.registry.lock();
            (registry.remove(connection_id), registry.len())
        };
        let Some(conn) = removed else {
            return false;
        };
        close_removed(&[conn], "removed", total);
        true
    }

    /// Subscribe a connection to a topic. Returns `false` for an unknown or
    /// closed connection, or an existing subscription.
    pub fn subscribe_to_topic(&self, connection_id: &ConnectionId, topic_id: TopicId) -> bool {
        let topic_label = topic_id.clone();
        let added = self.registry.lock().subscribe(connection_id, topic_id);
        if added {
            debug!(conn_id = %connection_id, topic_id = %topic_label, "subscribed to topic");
        }
        added
    }

    /// Unsubscribe a connection from a topic. Returns `false`, changing
    /// nothing, when the connection is unknown or was not subscribed.
    pub fn unsubscribe_from_topic(&self, connection_id: &ConnectionId, topic_id: &TopicId) -> bool {
        let removed = self.registry.lock().unsubscribe(connection_id, topic_id);
        if removed {
            debug!(conn_id = %connection_id, topic_id = %topic_id, "unsubscribed from topic");
        }
        removed
    }

    /// Note client activity. A stale connection becomes active again;
    /// unknown and closed connections return `false`.
    pub fn record_heartbeat(&self, connection_id: &ConnectionId) -> bool {
        let now = Instant::now();
        let mut registry = self.registry.lock();
        registry
            .get_mut(connection_id)
            .is_some_and(|conn| conn.record_heartbeat(now))
    }

    // ── Read helpers ────────────────────────────────────────────────

    /// Snapshot of one connection.
    pub fn connection_info(&self, connection_id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let now = Instant::now();
        self.registry
            .lock()
            .get(connection_id)
            .map(|conn| conn.snapshot(now))
    }

    /// Connections owned by `user_id`, sorted.
    pub fn user_connections(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.registry.lock().user_connections(user_id)
    }

    /// Connections subscribed to `topic_id`, sorted.
    pub fn topic_subscribers(&self, topic_id: &TopicId) -> Vec<ConnectionId> {
        self.registry.lock().topic_subscribers(topic_id)
    }

    /// Registered connections, in any state.
    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Messages waiting for the next drain.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Stop background tasks, close every socket, and clear all state.
    ///
    /// Idempotent. Afterwards `add_connection` fails with
    /// [`RealtimeError::ShuttingDown`] and the router targets nobody.
    pub async fn shutdown(&self) {
        if self.is_shutting_down() {
            return;
        }
        let handles = std::mem::take(&mut *self.tasks.lock());
        let aborted = self
            .shutdown
            .graceful_shutdown(handles, Some(TASK_SHUTDOWN_TIMEOUT))
            .await;
        if aborted > 0 {
            warn!(aborted, "realtime tasks did not stop in time");
        }

        let drained = self.registry.lock().drain();
        let pending = self.queue.lock().clear();
        if pending > 0 {
            warn!(pending, "discarding undelivered messages on shutdown");
        }
        gauge!(telemetry::QUEUE_LENGTH).set(0.0);
        let closed = drained.len();
        close_removed(&drained, "shutdown", 0);
        info!(closed, "realtime manager shut down");
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

/// Close the sockets of connections already taken out of the registry.
pub(crate) fn close_removed(conns: &[Connection], reason: &'static str, remaining: usize) {
    if conns.is_empty() {
        return;
    }
    let now = Instant::now();
    for conn in conns {
        conn.socket().close();
        debug!(
            conn_id = %conn.id,
            user_id = %conn.user_id,
            reason,
            age_ms = duration_ms(now.saturating_duration_since(conn.connected_at)),
            "connection removed"
        );
    }
    counter!(telemetry::DISCONNECTIONS_TOTAL, "reason" => reason).increment(conns.len() as u64);
    set_active_gauge(remaining);
}

#[allow(clippy::cast_precision_loss)]
fn set_active_gauge(total: usize) {
    gauge!(telemetry::CONNECTIONS_ACTIVE).set(total as f64);
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::payload::Payload;
    use crate::socket::testing::RecordingSocket;

    fn manager() -> Arc<RealtimeManager> {
        RealtimeManager::new(RealtimeConfig::default()).unwrap()
    }

    fn cid(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    #[test]
    fn new_rejects_invalid_config() {
        let cfg = RealtimeConfig {
            max_queue_size: 0,
            ..RealtimeConfig::default()
        };
        assert!(matches!(
            RealtimeManager::new(cfg),
            Err(RealtimeError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn add_and_remove_connection() {
        let mgr = manager();
        let socket = RecordingSocket::new();
        mgr.add_connection(cid("c1"), "u1".into(), socket.clone(), Some("t1".into()))
            .unwrap();
        assert_eq!(mgr.connection_count(), 1);
        assert_eq!(mgr.topic_subscribers(&"t1".into()), vec![cid("c1")]);

        assert!(mgr.remove_connection(&cid("c1")));
        assert!(socket.is_closed());
        assert_eq!(mgr.connection_count(), 0);
        assert!(mgr.user_connections(&"u1".into()).is_empty());
        assert!(!mgr.remove_connection(&cid("c1")));
    }

    #[tokio::test]
    async fn duplicate_connection_is_rejected() {
        let mgr = manager();
        mgr.add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), None)
            .unwrap();
        let err = mgr
            .add_connection(cid("c1"), "u2".into(), RecordingSocket::new(), None)
            .unwrap_err();
        assert!(matches!(err, RealtimeError::DuplicateConnection(_)));
        assert!(mgr.user_connections(&"u2".into()).is_empty());
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_round_trip() {
        let mgr = manager();
        mgr.add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), None)
            .unwrap();
        assert!(mgr.subscribe_to_topic(&cid("c1"), "t1".into()));
        assert!(!mgr.subscribe_to_topic(&cid("c1"), "t1".into()));
        assert!(mgr.unsubscribe_from_topic(&cid("c1"), &"t1".into()));
        assert!(!mgr.unsubscribe_from_topic(&cid("c1"), &"t1".into()));
        assert!(!mgr.subscribe_to_topic(&cid("ghost"), "t1".into()));
        assert_eq!(mgr.get_stats().active_topics, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_info_reports_state_and_age() {
        let mgr = manager();
        mgr.add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), Some("t1".into()))
            .unwrap();
        time::advance(Duration::from_millis(250)).await;
        let info = mgr.connection_info(&cid("c1")).unwrap();
        assert_eq!(info.state, ConnectionState::Active);
        assert_eq!(info.age_ms, 250);
        assert_eq!(info.topics, vec![TopicId::from("t1")]);
        assert!(mgr.connection_info(&cid("ghost")).is_none());
    }

    #[tokio::test]
    async fn record_heartbeat_unknown_is_false() {
        let mgr = manager();
        assert!(!mgr.record_heartbeat(&cid("ghost")));
        mgr.add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), None)
            .unwrap();
        assert!(mgr.record_heartbeat(&cid("c1")));
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_is_idempotent() {
        let mgr = manager();
        mgr.start();
        let s1 = RecordingSocket::new();
        let s2 = RecordingSocket::new();
        mgr.add_connection(cid("c1"), "u1".into(), s1.clone(), Some("t1".into()))
            .unwrap();
        mgr.add_connection(cid("c2"), "u2".into(), s2.clone(), None)
            .unwrap();
        let _ = mgr.broadcast_to_all(Payload::from("bye"), &[]);

        mgr.shutdown().await;
        mgr.shutdown().await;

        assert!(mgr.is_shutting_down());
        assert!(s1.is_closed());
        assert!(s2.is_closed());
        let stats = mgr.get_stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_topics, 0);
        assert_eq!(stats.queue_length, 0);
    }

    #[tokio::test]
    async fn add_after_shutdown_fails() {
        let mgr = manager();
        mgr.shutdown().await;
        let err = mgr
            .add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), None)
            .unwrap_err();
        assert!(matches!(err, RealtimeError::ShuttingDown));
        // Starting a shut-down manager spawns nothing
        mgr.start();
        assert!(mgr.tasks.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn adds_racing_shutdown_never_outlive_it() {
        let mgr = manager();
        mgr.start();
        let adders: Vec<_> = (0..4)
            .map(|worker| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move {
                    for i in 0..500 {
                        let id = cid(&format!("c{worker}-{i}"));
                        let _ = mgr.add_connection(id, "u1".into(), RecordingSocket::new(), None);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        mgr.shutdown().await;
        for adder in adders {
            adder.await.unwrap();
        }
        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(mgr.get_stats().active_users, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_drain_delivers_queued_messages() {
        let mgr = manager();
        mgr.start();
        mgr.start();
        assert_eq!(mgr.tasks.lock().len(), 3);

        let socket = RecordingSocket::new();
        mgr.add_connection(cid("c1"), "u1".into(), socket.clone(), Some("t1".into()))
            .unwrap();
        assert_eq!(mgr.broadcast_to_topic(&"t1".into(), Payload::from("tick"), &[]), 1);
        assert!(socket.sent_text().is_empty());

        time::sleep(mgr.config().queue_process_interval * 2).await;
        assert_eq!(socket.sent_text(), vec!["tick"]);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_stop_when_manager_dropped() {
        let mgr = manager();
        mgr.start();
        let handles = std::mem::take(&mut *mgr.tasks.lock());
        drop(mgr);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
