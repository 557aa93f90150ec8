//! Per-connection record and liveness state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::ids::{ConnectionId, TopicId, UserId};
use crate::socket::ConnectionSocket;

/// Liveness state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Registered and answering heartbeats.
    Active,
    /// Missed its heartbeat deadline; still deliverable, awaiting the sweeper.
    Stale,
    /// A write failed or the connection was removed; never delivered to again.
    Closed,
}

/// Canonical record of one live client channel.
///
/// Only the registry holds these; every field is mutated under its lock.
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) user_id: UserId,
    pub(crate) topics: HashSet<TopicId>,
    socket: Arc<dyn ConnectionSocket>,
    pub(crate) connected_at: Instant,
    pub(crate) last_heartbeat_at: Instant,
    pub(crate) state: ConnectionState,
    pub(crate) stale_since: Option<Instant>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        user_id: UserId,
        socket: Arc<dyn ConnectionSocket>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            user_id,
            topics: HashSet::new(),
            socket,
            connected_at: now,
            last_heartbeat_at: now,
            state: ConnectionState::Active,
            stale_since: None,
        }
    }

    /// Handle used for a single delivery or ping outside the registry lock.
    pub(crate) fn socket(&self) -> Arc<dyn ConnectionSocket> {
        Arc::clone(&self.socket)
    }

    pub(crate) fn is_deliverable(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Refresh liveness. A stale connection becomes active again; a closed
    /// one stays closed.
    pub(crate) fn record_heartbeat(&mut self, now: Instant) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.last_heartbeat_at = now;
        self.state = ConnectionState::Active;
        self.stale_since = None;
        true
    }

    /// Transition ACTIVE -> STALE if silent for longer than `timeout`.
    pub(crate) fn mark_stale_if_silent(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.state != ConnectionState::Active
            || now.saturating_duration_since(self.last_heartbeat_at) <= timeout
        {
            return false;
        }
        self.state = ConnectionState::Stale;
        self.stale_since = Some(now);
        true
    }

    pub(crate) fn mark_closed(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        true
    }

    /// Closed, or stale for at least `grace`.
    pub(crate) fn is_expired(&self, now: Instant, grace: Duration) -> bool {
        match (self.state, self.stale_since) {
            (ConnectionState::Closed, _) => true,
            (ConnectionState::Stale, Some(since)) => {
                now.saturating_duration_since(since) >= grace
            }
            _ => false,
        }
    }

    pub(crate) fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        let mut topics: Vec<TopicId> = self.topics.iter().cloned().collect();
        topics.sort();
        ConnectionSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            topics,
            state: self.state,
            age_ms: millis(now.saturating_duration_since(self.connected_at)),
            since_heartbeat_ms: millis(now.saturating_duration_since(self.last_heartbeat_at)),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Read-only view of a connection, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Connection id.
    pub id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// Subscribed topics, sorted.
    pub topics: Vec<TopicId>,
    /// Current liveness state.
    pub state: ConnectionState,
    /// Milliseconds since registration.
    pub age_ms: u64,
    /// Milliseconds since the last heartbeat.
    pub since_heartbeat_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::RecordingSocket;

    fn make_connection(now: Instant) -> Connection {
        Connection::new("c1".into(), "u1".into(), RecordingSocket::new(), now)
    }

    #[tokio::test(start_paused = true)]
    async fn new_connection_is_active() {
        let conn = make_connection(Instant::now());
        assert_eq!(conn.state, ConnectionState::Active);
        assert!(conn.topics.is_empty());
        assert!(conn.is_deliverable());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_goes_stale_after_timeout() {
        let start = Instant::now();
        let mut conn = make_connection(start);
        let timeout = Duration::from_secs(60);

        assert!(!conn.mark_stale_if_silent(start + Duration::from_secs(60), timeout));
        assert!(conn.mark_stale_if_silent(start + Duration::from_secs(61), timeout));
        assert_eq!(conn.state, ConnectionState::Stale);
        assert!(conn.stale_since.is_some());
        // Already stale: no second transition
        assert!(!conn.mark_stale_if_silent(start + Duration::from_secs(90), timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_revives_stale_connection() {
        let start = Instant::now();
        let mut conn = make_connection(start);
        let _ = conn.mark_stale_if_silent(start + Duration::from_secs(10), Duration::from_secs(1));
        assert!(conn.record_heartbeat(start + Duration::from_secs(11)));
        assert_eq!(conn.state, ConnectionState::Active);
        assert!(conn.stale_since.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_does_not_revive_closed_connection() {
        let now = Instant::now();
        let mut conn = make_connection(now);
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(!conn.record_heartbeat(now));
        assert_eq!(conn.state, ConnectionState::Closed);
        assert!(!conn.is_deliverable());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_respects_grace_period() {
        let start = Instant::now();
        let mut conn = make_connection(start);
        let grace = Duration::from_secs(30);
        assert!(!conn.is_expired(start, grace));

        let _ = conn.mark_stale_if_silent(start + Duration::from_secs(2), Duration::from_secs(1));
        assert!(!conn.is_expired(start + Duration::from_secs(10), grace));
        assert!(conn.is_expired(start + Duration::from_secs(32), grace));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_expires_immediately() {
        let now = Instant::now();
        let mut conn = make_connection(now);
        let _ = conn.mark_closed();
        assert!(conn.is_expired(now, Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_sorts_topics() {
        let now = Instant::now();
        let mut conn = make_connection(now);
        let _ = conn.topics.insert("t2".into());
        let _ = conn.topics.insert("t1".into());
        let snap = conn.snapshot(now + Duration::from_millis(1500));
        assert_eq!(snap.topics, vec![TopicId::from("t1"), TopicId::from("t2")]);
        assert_eq!(snap.age_ms, 1500);
        assert_eq!(snap.state, ConnectionState::Active);
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Stale).unwrap(),
            "\"stale\""
        );
    }
}
