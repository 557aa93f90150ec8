//! Bounded outbound message queue with drop-oldest backpressure.

use std::collections::VecDeque;
use std::fmt;

use tokio::time::Instant;

use crate::ids::ConnectionId;
use crate::payload::Payload;

/// Which router operation produced a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// `send_to_connection`
    Connection,
    /// `broadcast_to_users`
    Users,
    /// `broadcast_to_topic`
    Topic,
    /// `broadcast_to_all`
    All,
}

impl DeliveryKind {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Users => "users",
            Self::Topic => "topic",
            Self::All => "all",
        }
    }
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending delivery.
///
/// Targets are resolved when the message is enqueued, so later
/// subscriptions do not widen an already queued broadcast.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Origin of the message.
    pub kind: DeliveryKind,
    /// Connections to deliver to.
    pub targets: Vec<ConnectionId>,
    /// Message body.
    pub payload: Payload,
    /// When the message entered the queue.
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    /// Build a message stamped with the current time.
    pub fn new(kind: DeliveryKind, targets: Vec<ConnectionId>, payload: Payload) -> Self {
        Self {
            kind,
            targets,
            payload,
            enqueued_at: Instant::now(),
        }
    }
}

/// FIFO of [`QueuedMessage`]s capped at `capacity`.
///
/// Pushing past capacity discards the oldest entries: the newest `capacity`
/// messages always survive.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: usize,
    dropped_total: u64,
}

impl OutboundQueue {
    /// Create an empty queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped_total: 0,
        }
    }

    /// Append a message, returning how many old messages were dropped to make room.
    pub fn push(&mut self, message: QueuedMessage) -> usize {
        self.messages.push_back(message);
        let mut dropped = 0;
        while self.messages.len() > self.capacity {
            let _ = self.messages.pop_front();
            dropped += 1;
        }
        self.dropped_total += dropped as u64;
        dropped
    }

    /// Remove up to `max` messages from the front.
    pub fn take_batch(&mut self, max: usize) -> Vec<QueuedMessage> {
        let n = max.min(self.messages.len());
        self.messages.drain(..n).collect()
    }

    /// Discard everything, returning how many messages were pending.
    pub fn clear(&mut self) -> usize {
        let pending = self.messages.len();
        self.messages.clear();
        pending
    }

    /// Pending message count.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Maximum pending messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages dropped for capacity over the queue's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Iterate pending messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }
}
