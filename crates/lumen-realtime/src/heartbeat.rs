//! Heartbeat liveness monitoring.

use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ids::ConnectionId;
use crate::manager::RealtimeManager;
use crate::socket::ConnectionSocket;
use crate::telemetry;

/// Outcome of one heartbeat pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections that went from active to stale this pass.
    pub newly_stale: usize,
    /// Sockets pinged successfully.
    pub pinged: usize,
    /// Pings that failed; those connections are now closed.
    pub failed: usize,
}

impl RealtimeManager {
    /// Run one heartbeat pass.
    ///
    /// Active connections silent for longer than `connection_timeout` become
    /// stale. Then every connection that is not closed gets pinged, stale
    /// ones included so a slow client can still answer and recover.
    /// Eviction is left to [`cleanup_inactive_connections`](Self::cleanup_inactive_connections).
    pub async fn check_heartbeats(&self) -> HeartbeatReport {
        let now = Instant::now();
        let (stale, sockets): (Vec<ConnectionId>, Vec<(ConnectionId, Arc<dyn ConnectionSocket>)>) = {
            let mut registry = self.registry.lock();
            let stale = registry.mark_silent_stale(now, self.config.connection_timeout);
            (stale, registry.live_sockets())
        };
        for id in &stale {
            info!(conn_id = %id, "connection missed heartbeat, marked stale");
        }
        counter!(telemetry::HEARTBEAT_TIMEOUTS_TOTAL).increment(stale.len() as u64);

        let results = join_all(sockets.iter().map(|(_, socket)| socket.ping())).await;
        let mut report = HeartbeatReport {
            newly_stale: stale.len(),
            ..HeartbeatReport::default()
        };
        let mut failed = Vec::new();
        for ((id, _), result) in sockets.into_iter().zip(results) {
            match result {
                Ok(()) => report.pinged += 1,
                Err(e) => {
                    warn!(conn_id = %id, error = %e, "heartbeat ping failed, closing connection");
                    failed.push(id);
                }
            }
        }
        if !failed.is_empty() {
            report.failed = failed.len();
            let mut registry = self.registry.lock();
            for id in &failed {
                if let Some(conn) = registry.get_mut(id) {
                    let _ = conn.mark_closed();
                }
            }
        }
        debug!(
            newly_stale = report.newly_stale,
            pinged = report.pinged,
            failed = report.failed,
            "heartbeat pass complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::connection::ConnectionState;
    use crate::socket::testing::RecordingSocket;

    fn cid(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn manager() -> Arc<RealtimeManager> {
        RealtimeManager::new(RealtimeConfig {
            connection_timeout: Duration::from_secs(60),
            ..RealtimeConfig::default()
        })
        .unwrap()
    }

    fn state(mgr: &RealtimeManager, id: &str) -> ConnectionState {
        mgr.connection_info(&cid(id)).unwrap().state
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connections_are_pinged_not_staled() {
        let mgr = manager();
        let socket = RecordingSocket::new();
        mgr.add_connection(cid("c1"), "u1".into(), socket.clone(), None)
            .unwrap();

        let report = mgr.check_heartbeats().await;
        assert_eq!(report, HeartbeatReport { newly_stale: 0, pinged: 1, failed: 0 });
        assert_eq!(socket.ping_count(), 1);
        assert_eq!(state(&mgr, "c1"), ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_goes_stale_after_timeout() {
        let mgr = manager();
        mgr.add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), None)
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(mgr.check_heartbeats().await.newly_stale, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = mgr.check_heartbeats().await;
        assert_eq!(report.newly_stale, 1);
        // Stale connections are still pinged
        assert_eq!(report.pinged, 1);
        assert_eq!(state(&mgr, "c1"), ConnectionState::Stale);
        assert_eq!(mgr.get_stats().stale_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_connection_active() {
        let mgr = manager();
        mgr.add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), None)
            .unwrap();
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(30)).await;
            assert!(mgr.record_heartbeat(&cid("c1")));
            let _ = mgr.check_heartbeats().await;
        }
        assert_eq!(state(&mgr, "c1"), ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connection_recovers_on_heartbeat() {
        let mgr = manager();
        mgr.add_connection(cid("c1"), "u1".into(), RecordingSocket::new(), None)
            .unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = mgr.check_heartbeats().await;
        assert_eq!(state(&mgr, "c1"), ConnectionState::Stale);

        assert!(mgr.record_heartbeat(&cid("c1")));
        assert_eq!(state(&mgr, "c1"), ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_closes_connection() {
        let mgr = manager();
        let socket = RecordingSocket::new();
        socket.fail_pings();
        mgr.add_connection(cid("c1"), "u1".into(), socket, None).unwrap();

        let report = mgr.check_heartbeats().await;
        assert_eq!(report.failed, 1);
        assert_eq!(state(&mgr, "c1"), ConnectionState::Closed);

        // Closed connections are neither pinged nor revived
        assert_eq!(mgr.check_heartbeats().await, HeartbeatReport::default());
        assert!(!mgr.record_heartbeat(&cid("c1")));
    }
}
