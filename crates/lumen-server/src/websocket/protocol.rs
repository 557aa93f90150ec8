//! JSON frames exchanged with WebSocket clients.

use lumen_realtime::{ConnectionId, Payload, RealtimeManager, TopicId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Commands a client may send as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Start receiving a topic's broadcasts.
    Subscribe {
        /// Topic to join.
        #[serde(rename = "topicId")]
        topic_id: TopicId,
    },
    /// Stop receiving a topic's broadcasts.
    Unsubscribe {
        /// Topic to leave.
        #[serde(rename = "topicId")]
        topic_id: TopicId,
    },
    /// Application-level keepalive, answered with [`ServerMessage::Pong`].
    Ping,
}

/// Frames the server sends on its own behalf (broadcast payloads are
/// forwarded untouched).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// First frame of every session.
    Connected {
        /// Id assigned to this connection.
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
    /// Reply to a subscribe command.
    Subscribed {
        /// Topic named in the command.
        #[serde(rename = "topicId")]
        topic_id: TopicId,
        /// `false` if the connection was already subscribed.
        changed: bool,
    },
    /// Reply to an unsubscribe command.
    Unsubscribed {
        /// Topic named in the command.
        #[serde(rename = "topicId")]
        topic_id: TopicId,
        /// `false` if the connection was not subscribed.
        changed: bool,
    },
    /// Reply to a ping command.
    Pong,
    /// The client sent something the server could not handle.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Encode as a JSON payload.
    pub fn to_payload(&self) -> Payload {
        // Every variant holds only strings and bools
        Payload::json(self).unwrap_or_else(|_| Payload::from(r#"{"type":"error"}"#))
    }
}

/// Apply one client text frame to the manager and build the reply.
pub fn handle_client_text(
    manager: &RealtimeManager,
    connection_id: &ConnectionId,
    text: &str,
) -> ServerMessage {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::Subscribe { topic_id }) => {
            let changed = manager.subscribe_to_topic(connection_id, topic_id.clone());
            ServerMessage::Subscribed { topic_id, changed }
        }
        Ok(ClientCommand::Unsubscribe { topic_id }) => {
            let changed = manager.unsubscribe_from_topic(connection_id, &topic_id);
            ServerMessage::Unsubscribed { topic_id, changed }
        }
        Ok(ClientCommand::Ping) => ServerMessage::Pong,
        Err(e) => {
            debug!(conn_id = %connection_id, error = %e, "unparseable client frame");
            ServerMessage::Error {
                message: format!("invalid message: {e}"),
            }
        }
    }
}
