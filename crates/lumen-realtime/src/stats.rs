//! Read-only statistics snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::connection::ConnectionState;
use crate::ids::TopicId;
use crate::manager::RealtimeManager;

/// Point-in-time counts derived from the registry, indices and queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    /// Registered connections, in any state.
    pub total_connections: usize,
    /// Users with at least one connection.
    pub active_users: usize,
    /// Topics with at least one subscriber.
    pub active_topics: usize,
    /// Messages waiting in the outbound queue.
    pub queue_length: usize,
    /// `total_connections / active_users`, or `0.0` with no users.
    pub average_connections_per_user: f64,
    /// Subscriber count per topic.
    pub topic_connections: BTreeMap<TopicId, usize>,
    /// Connections currently stale.
    pub stale_connections: usize,
    /// Connections closed and awaiting the sweeper.
    pub closed_connections: usize,
    /// Messages dropped by queue backpressure since startup.
    pub dropped_messages: u64,
    /// Successful per-connection deliveries since startup.
    pub delivered_messages: u64,
    /// Failed per-connection deliveries since startup.
    pub failed_deliveries: u64,
}

impl RealtimeManager {
    /// Build a [`ManagerStats`] snapshot. Mutates nothing.
    pub fn get_stats(&self) -> ManagerStats {
        let (queue_length, dropped_messages) = {
            let queue = self.queue.lock();
            (queue.len(), queue.dropped_total())
        };
        let registry = self.registry.lock();
        let total_connections = registry.len();
        let active_users = registry.user_count();
        ManagerStats {
            total_connections,
            active_users,
            active_topics: registry.topic_count(),
            queue_length,
            average_connections_per_user: average(total_connections, active_users),
            topic_connections: registry.topic_counts(),
            stale_connections: registry.count_in_state(ConnectionState::Stale),
            closed_connections: registry.count_in_state(ConnectionState::Closed),
            dropped_messages,
            delivered_messages: self.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn average(connections: usize, users: usize) -> f64 {
    if users == 0 {
        0.0
    } else {
        connections as f64 / users as f64
    }
}
