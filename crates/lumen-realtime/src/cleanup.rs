//! Periodic sweep of stale and closed connections.

use metrics::counter;
use tokio::time::Instant;
use tracing::info;

use crate::manager::{RealtimeManager, close_removed};
use crate::telemetry;

impl RealtimeManager {
    /// Remove every closed connection and every connection stale for at
    /// least `stale_grace_period`. Returns how many were removed.
    pub fn cleanup_inactive_connections(&self) -> usize {
        let (removed, remaining) = {
            let mut registry = self.registry.lock();
            let removed = registry.remove_expired(Instant::now(), self.config.stale_grace_period);
            (removed, registry.len())
        };
        if removed.is_empty() {
            return 0;
        }
        close_removed(&removed, "inactive", remaining);
        counter!(telemetry::CLEANUP_REMOVED_TOTAL).increment(removed.len() as u64);
        info!(removed = removed.len(), remaining, "swept inactive connections");
        removed.len()
    }
}
