//! Metric names recorded through the `metrics` facade.
//!
//! Nothing is exported unless the host process installs a recorder.

/// Connections registered (counter).
pub const CONNECTIONS_TOTAL: &str = "realtime_connections_total";
/// Connections removed by any path (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "realtime_disconnections_total";
/// Currently registered connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "realtime_connections_active";
/// Messages accepted into the outbound queue (counter, labels: kind).
pub const MESSAGES_ENQUEUED_TOTAL: &str = "realtime_messages_enqueued_total";
/// Messages discarded by drop-oldest backpressure (counter).
pub const QUEUE_DROPPED_TOTAL: &str = "realtime_queue_dropped_total";
/// Pending messages after the last queue mutation (gauge).
pub const QUEUE_LENGTH: &str = "realtime_queue_length";
/// Successful per-connection deliveries (counter).
pub const DELIVERIES_TOTAL: &str = "realtime_deliveries_total";
/// Failed per-connection deliveries (counter).
pub const DELIVERY_FAILURES_TOTAL: &str = "realtime_delivery_failures_total";
/// Connections marked stale by the heartbeat monitor (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "realtime_heartbeat_timeouts_total";
/// Connections reclaimed by the cleanup sweeper (counter).
pub const CLEANUP_REMOVED_TOTAL: &str = "realtime_cleanup_removed_total";
