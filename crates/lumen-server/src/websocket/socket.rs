//! [`ConnectionSocket`] over an axum `WebSocket`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use lumen_realtime::{ConnectionSocket, Payload, SocketError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Write side of one WebSocket client.
///
/// Frames go through a bounded channel to a dedicated writer task, so a
/// slow client costs at most `write_timeout` per send before it is reported
/// as [`SocketError::Timeout`]. Closing also cancels [`closed`](Self::closed),
/// which ends the session's read loop even if the peer has gone silent.
pub struct WsSocket {
    tx: mpsc::Sender<Message>,
    write_timeout: Duration,
    closed: AtomicBool,
    close_signal: CancellationToken,
}

impl WsSocket {
    /// Create a socket feeding `tx`.
    pub fn new(tx: mpsc::Sender<Message>, write_timeout: Duration) -> Self {
        Self {
            tx,
            write_timeout,
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
        }
    }

    /// Token cancelled once the socket is closed from either side.
    pub fn closed(&self) -> CancellationToken {
        self.close_signal.clone()
    }

    /// Whether [`close`](ConnectionSocket::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn enqueue(&self, message: Message) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        match self.tx.send_timeout(message, self.write_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SocketError::Timeout),
            Err(SendTimeoutError::Closed(_)) => Err(SocketError::Closed),
        }
    }
}

#[async_trait]
impl ConnectionSocket for WsSocket {
    async fn send(&self, payload: &Payload) -> Result<(), SocketError> {
        let message = match payload.as_str() {
            Some(text) => Message::Text(text.into()),
            None => Message::Binary(payload.clone().into_bytes()),
        };
        self.enqueue(message).await
    }

    async fn ping(&self) -> Result<(), SocketError> {
        self.enqueue(Message::Ping(Vec::new().into())).await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_signal.cancel();
        // Full channel: the writer still exits once every sender is dropped
        let _ = self.tx.try_send(Message::Close(None));
    }
}

/// Forward frames from `rx` to the client until a Close frame has been
/// written, the channel closes, or a write fails.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    })
}
