//! # lumen-realtime
//!
//! Connection registry and broadcast manager for live learning sessions.
//!
//! - Registry of live connections, indexed by user and by topic
//! - Unicast, per-user, per-topic and global fan-out through a bounded
//!   drop-oldest queue drained on a fixed interval
//! - Heartbeat monitor (active -> stale) and cleanup sweeper (stale or
//!   closed -> removed)
//! - Transport-agnostic: sockets plug in through [`ConnectionSocket`]
//!
//! ```ignore
//! let manager = RealtimeManager::new(RealtimeConfig::default())?;
//! manager.start();
//! manager.add_connection(ConnectionId::generate(), "u1".into(), socket, Some("rust".into()))?;
//! let reached = manager.broadcast_to_topic(&"rust".into(), Payload::json(&event)?, &[]);
//! ```

#![deny(unsafe_code)]

pub mod cleanup;
pub mod config;
pub mod connection;
pub mod errors;
pub mod heartbeat;
pub mod ids;
pub mod manager;
pub mod payload;
pub mod queue;
mod registry;
pub mod router;
pub mod shutdown;
pub mod socket;
pub mod stats;
pub mod telemetry;

pub use config::RealtimeConfig;
pub use connection::{ConnectionSnapshot, ConnectionState};
pub use errors::{RealtimeError, Result, SocketError};
pub use heartbeat::HeartbeatReport;
pub use ids::{ConnectionId, TopicId, UserId};
pub use manager::RealtimeManager;
pub use payload::Payload;
pub use router::DrainReport;
pub use shutdown::ShutdownCoordinator;
pub use socket::ConnectionSocket;
pub use stats::ManagerStats;
