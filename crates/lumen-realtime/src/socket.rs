//! Transport-facing socket abstraction.

use async_trait::async_trait;

use crate::errors::SocketError;
use crate::payload::Payload;

/// Write side of one client channel, implemented by the transport adapter.
///
/// The registry owns each socket. Only the queue drain, the heartbeat
/// monitor and the removal paths call into it.
#[async_trait]
pub trait ConnectionSocket: Send + Sync {
    /// Deliver one payload to the client.
    async fn send(&self, payload: &Payload) -> Result<(), SocketError>;

    /// Send a liveness probe. Transports without a protocol-level ping keep
    /// the default, relying on the client's own traffic to refresh liveness.
    async fn ping(&self) -> Result<(), SocketError> {
        Ok(())
    }

    /// Close the channel. Must not block; called with no I/O guarantees.
    fn close(&self);
}
