//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use lumen_realtime::{ConnectionId, ConnectionSocket, RealtimeManager, TopicId, UserId};
use lumen_settings::ServerSettings;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::protocol::{ServerMessage, handle_client_text};
use super::socket::{WsSocket, spawn_writer};

/// Per-session transport limits.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Outbound frame channel capacity.
    pub send_buffer: usize,
    /// Longest a single send may wait for channel space.
    pub write_timeout: Duration,
}

impl From<&ServerSettings> for SessionOptions {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            send_buffer: settings.send_buffer,
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection with the manager
/// 2. Queues a `connected` frame carrying the connection id
/// 3. Treats every inbound frame as a heartbeat and dispatches text commands
/// 4. Removes the connection on close or read error, or ends as soon as the
///    manager closes it (heartbeat sweep, failed send, shutdown)
#[instrument(skip_all, fields(conn_id = %connection_id, user_id = %user_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    user_id: UserId,
    topic_id: Option<TopicId>,
    manager: Arc<RealtimeManager>,
    options: SessionOptions,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::channel::<Message>(options.send_buffer);
    let writer = spawn_writer(ws_tx, rx);
    let socket = Arc::new(WsSocket::new(tx, options.write_timeout));

    if let Err(e) = manager.add_connection(connection_id.clone(), user_id, socket.clone(), topic_id) {
        warn!(error = %e, "rejecting websocket session");
        socket.close();
        drop(socket);
        finish_writer(writer, options.write_timeout).await;
        return;
    }
    info!("client connected");

    let welcome = ServerMessage::Connected {
        connection_id: connection_id.clone(),
    };
    let _ = manager.send_to_connection(&connection_id, welcome.to_payload());

    let closed = socket.closed();
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = closed.cancelled() => {
                info!("connection closed by manager");
                break;
            }
        };
        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
            None => break,
        };
        let _ = manager.record_heartbeat(&connection_id);
        match message {
            Message::Text(text) => {
                let reply = handle_client_text(&manager, &connection_id, text.as_str());
                let _ = manager.send_to_connection(&connection_id, reply.to_payload());
            }
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
            // Binary frames carry no commands; Ping is answered by axum
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let _ = manager.remove_connection(&connection_id);
    // Already closed unless the manager had dropped the connection first
    socket.close();
    drop(socket);
    finish_writer(writer, options.write_timeout).await;
    info!("client disconnected");
}

/// Let the writer flush its Close frame, then abort it if the peer stopped
/// reading.
async fn finish_writer(mut writer: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut writer).await.is_err() {
        debug!("websocket writer did not finish, aborting");
        writer.abort();
    }
}
