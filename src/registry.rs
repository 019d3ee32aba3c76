use std::{collections::HashSet, fmt, sync::{Arc, Mutex, MutexGuard}};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{auth::Identity, events::ServerEvent, RelayError, RelayResult};

/// Events a connection may have queued before further deliveries to it are
/// dropped.
pub const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live, authenticated socket.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    rooms: Mutex<HashSet<String>>,
    outbox: mpsc::Sender<ServerEvent>,
}

impl Connection {
    /// Queues an event for the connection's writer. Returns false once the
    /// writer has gone away, or when the peer has fallen so far behind that
    /// the outbox is full and the event was dropped.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.outbox.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.id, "outbox full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms().iter().cloned().collect()
    }

    pub fn is_in(&self, room_id: &str) -> bool {
        self.rooms().contains(room_id)
    }

    // Only the room router mutates the joined set, and always takes this lock
    // before touching a room entry.
    pub(crate) fn rooms(&self) -> MutexGuard<'_, HashSet<String>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: Identity, outbox: mpsc::Sender<ServerEvent>) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            id: ConnectionId::new(),
            identity,
            rooms: Mutex::new(HashSet::new()),
            outbox,
        });
        self.connections.insert(conn.id, conn.clone());

        tracing::debug!(connection_id = %conn.id, user_id = %conn.identity.user_id, "registered connection");
        conn
    }

    /// Removes the connection. Only the first call for an id gets it back.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn lookup(&self, id: ConnectionId) -> RelayResult<Arc<Connection>> {
        self.connections
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::NotFound(format!("connection {id}")))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
