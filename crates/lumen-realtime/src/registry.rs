//! Connection registry and its user/topic indices.
//!
//! Records and both indices live in one struct so every mutation updates
//! them together. The manager wraps a [`Registry`] in a single mutex; nothing
//! else touches the indices.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::error;

use crate::connection::{Connection, ConnectionState};
use crate::errors::{RealtimeError, Result};
use crate::ids::{ConnectionId, TopicId, UserId};
use crate::socket::ConnectionSocket;

#[derive(Default)]
pub(crate) struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_topic: HashMap<TopicId, HashSet<ConnectionId>>,
}

/// Add `id` under `key`.
fn attach<K: Eq + Hash>(index: &mut HashMap<K, HashSet<ConnectionId>>, key: K, id: ConnectionId) {
    let _ = index.entry(key).or_default().insert(id);
}

/// Remove `id` from `key`'s set, dropping the key once its set is empty.
/// Returns whether `id` was present.
fn detach<K: Eq + Hash>(
    index: &mut HashMap<K, HashSet<ConnectionId>>,
    key: &K,
    id: &ConnectionId,
) -> bool {
    let Some(set) = index.get_mut(key) else {
        return false;
    };
    let removed = set.remove(id);
    if set.is_empty() {
        let _ = index.remove(key);
    }
    removed
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &mut self,
        id: ConnectionId,
        user_id: UserId,
        socket: Arc<dyn ConnectionSocket>,
        topic: Option<TopicId>,
        now: Instant,
    ) -> Result<()> {
        if self.connections.contains_key(&id) {
            return Err(RealtimeError::DuplicateConnection(id));
        }
        let mut conn = Connection::new(id.clone(), user_id.clone(), socket, now);
        if let Some(topic) = topic {
            let _ = conn.topics.insert(topic.clone());
            attach(&mut self.by_topic, topic, id.clone());
        }
        attach(&mut self.by_user, user_id, id.clone());
        let _ = self.connections.insert(id, conn);
        Ok(())
    }

    /// Remove the record first, then purge it from every index.
    pub(crate) fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(id)?;
        let indexed = detach(&mut self.by_user, &conn.user_id, id);
        if !indexed {
            error!(conn_id = %id, user_id = %conn.user_id, "user index was missing connection");
        }
        debug_assert!(indexed, "user index diverged from registry");
        for topic in &conn.topics {
            let indexed = detach(&mut self.by_topic, topic, id);
            if !indexed {
                error!(conn_id = %id, topic_id = %topic, "topic index was missing connection");
            }
            debug_assert!(indexed, "topic index diverged from registry");
        }
        Some(conn)
    }

    pub(crate) fn subscribe(&mut self, id: &ConnectionId, topic: TopicId) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        if !conn.is_deliverable() || !conn.topics.insert(topic.clone()) {
            return false;
        }
        attach(&mut self.by_topic, topic, id.clone());
        true
    }

    pub(crate) fn unsubscribe(&mut self, id: &ConnectionId, topic: &TopicId) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        if !conn.topics.remove(topic) {
            return false;
        }
        let _ = detach(&mut self.by_topic, topic, id);
        true
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Socket of a connection that may still be written to.
    pub(crate) fn deliverable_socket(&self, id: &ConnectionId) -> Option<Arc<dyn ConnectionSocket>> {
        self.connections
            .get(id)
            .filter(|c| c.is_deliverable())
            .map(Connection::socket)
    }

    // ── Target resolution ───────────────────────────────────────────

    pub(crate) fn user_targets(&self, users: &[UserId]) -> Vec<ConnectionId> {
        let mut seen = HashSet::new();
        users
            .iter()
            .filter_map(|user| self.by_user.get(user))
            .flatten()
            .filter(|id| seen.insert(*id))
            .filter(|id| self.is_deliverable(id))
            .cloned()
            .collect()
    }

    pub(crate) fn topic_targets(&self, topic: &TopicId, exclude: &[UserId]) -> Vec<ConnectionId> {
        let Some(ids) = self.by_topic.get(topic) else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| self.is_target(id, exclude))
            .cloned()
            .collect()
    }

    pub(crate) fn all_targets(&self, exclude: &[UserId]) -> Vec<ConnectionId> {
        self.connections
            .keys()
            .filter(|id| self.is_target(id, exclude))
            .cloned()
            .collect()
    }

    fn is_deliverable(&self, id: &ConnectionId) -> bool {
        self.connections.get(id).is_some_and(Connection::is_deliverable)
    }

    fn is_target(&self, id: &ConnectionId, exclude: &[UserId]) -> bool {
        self.connections
            .get(id)
            .is_some_and(|c| c.is_deliverable() && !exclude.contains(&c.user_id))
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Mark every connection silent for longer than `timeout` as stale.
    pub(crate) fn mark_silent_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values_mut()
            .filter_map(|c| c.mark_stale_if_silent(now, timeout).then(|| c.id.clone()))
            .collect()
    }

    /// Sockets of every connection not yet closed.
    pub(crate) fn live_sockets(&self) -> Vec<(ConnectionId, Arc<dyn ConnectionSocket>)> {
        self.connections
            .values()
            .filter(|c| c.is_deliverable())
            .map(|c| (c.id.clone(), c.socket()))
            .collect()
    }

    /// Remove every closed connection and every connection stale for at least `grace`.
    pub(crate) fn remove_expired(&mut self, now: Instant, grace: Duration) -> Vec<Connection> {
        let expired: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_expired(now, grace))
            .map(|c| c.id.clone())
            .collect();
        expired.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Empty the registry and both indices, handing back every record.
    pub(crate) fn drain(&mut self) -> Vec<Connection> {
        self.by_user.clear();
        self.by_topic.clear();
        self.connections.drain().map(|(_, c)| c).collect()
    }

    // ── Read-only views ─────────────────────────────────────────────

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.by_topic.len()
    }

    pub(crate) fn topic_counts(&self) -> BTreeMap<TopicId, usize> {
        self.by_topic
            .iter()
            .map(|(topic, ids)| (topic.clone(), ids.len()))
            .collect()
    }

    pub(crate) fn count_in_state(&self, state: ConnectionState) -> usize {
        self.connections.values().filter(|c| c.state == state).count()
    }

    pub(crate) fn user_connections(&self, user: &UserId) -> Vec<ConnectionId> {
        sorted(self.by_user.get(user))
    }

    pub(crate) fn topic_subscribers(&self, topic: &TopicId) -> Vec<ConnectionId> {
        sorted(self.by_topic.get(topic))
    }

    /// Verify that records and indices agree in both directions.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> std::result::Result<(), String> {
        for (user, ids) in &self.by_user {
            if ids.is_empty() {
                return Err(format!("empty user set for {user}"));
            }
            for id in ids {
                match self.connections.get(id) {
                    Some(c) if &c.user_id == user => {}
                    _ => return Err(format!("user index {user} -> {id} dangling")),
                }
            }
        }
        for (topic, ids) in &self.by_topic {
            if ids.is_empty() {
                return Err(format!("empty topic set for {topic}"));
            }
            for id in ids {
                match self.connections.get(id) {
                    Some(c) if c.topics.contains(topic) => {}
                    _ => return Err(format!("topic index {topic} -> {id} dangling")),
                }
            }
        }
        for (id, conn) in &self.connections {
            if !self.by_user.get(&conn.user_id).is_some_and(|s| s.contains(id)) {
                return Err(format!("{id} missing from user index"));
            }
            for topic in &conn.topics {
                if !self.by_topic.get(topic).is_some_and(|s| s.contains(id)) {
                    return Err(format!("{id} missing from topic index {topic}"));
                }
            }
        }
        Ok(())
    }
}

fn sorted(ids: Option<&HashSet<ConnectionId>>) -> Vec<ConnectionId> {
    let mut ids: Vec<ConnectionId> = ids.into_iter().flatten().cloned().collect();
    ids.sort();
    ids
}
