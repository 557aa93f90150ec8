//! Error types.
//!
//! Expected conditions (unknown ids, closed sockets, a full queue) are not
//! errors: they surface as `false`, `0`, or a silent drop. Only caller logic
//! errors and configuration problems are reported through [`RealtimeError`].

use thiserror::Error;

use crate::ids::ConnectionId;

/// Errors returned by the realtime manager.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// `add_connection` was called with an id that is already registered.
    #[error("connection already registered: {0}")]
    DuplicateConnection(ConnectionId),
    /// The manager has been shut down and accepts no new connections.
    #[error("realtime manager is shutting down")]
    ShuttingDown,
    /// A payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    /// A configuration value is unusable.
    #[error("invalid realtime config: {0}")]
    InvalidConfig(String),
}

/// Result type for realtime operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Failure reported by a [`ConnectionSocket`](crate::socket::ConnectionSocket).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The peer or the writer task is gone.
    #[error("socket closed")]
    Closed,
    /// The write did not complete in time.
    #[error("socket write timed out")]
    Timeout,
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}
