pub mod msg;
pub mod session;
mod ws;

use std::{collections::HashSet, sync::Arc};

use axum::{routing::get, Router};
use dashmap::DashMap;
use serde_json::Value;

use crate::{
    events::{ServerEvent, SignalQuery},
    registry::{Connection, ConnectionId, ConnectionRegistry},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::relay_ws))
}

/// A signaling payload on its way through the relay. `data` is never
/// interpreted beyond the optional `roomId` fallback.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub from: ConnectionId,
    pub to: Option<ConnectionId>,
    pub data: Value,
    pub room_id: Option<String>,
}

impl SignalEnvelope {
    pub fn new(from: ConnectionId, SignalQuery { to, data, room_id }: SignalQuery) -> Self {
        let room_id = room_id.or_else(|| {
            data.get("roomId")
                .and_then(Value::as_str)
                .map(str::to_owned)
        });

        SignalEnvelope { from, to, data, room_id }
    }
}

/// Room membership and fan-out.
///
/// Lock order is always the connection's joined set first, then the room
/// entry. Deliveries happen after every lock is released.
#[derive(Debug)]
pub struct RoomRouter {
    registry: Arc<ConnectionRegistry>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
}

impl RoomRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        RoomRouter {
            registry,
            rooms: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn join(&self, conn: &Connection, room_id: &str) -> bool {
        let others: Vec<ConnectionId> = {
            let mut joined = conn.rooms();
            let mut members = self.rooms.entry(room_id.to_owned()).or_default();
            if !members.insert(conn.id) {
                return false;
            }
            joined.insert(room_id.to_owned());

            members.iter().copied().filter(|id| *id != conn.id).collect()
        };

        tracing::info!(connection_id = %conn.id, room_id, members = others.len() + 1, "joined room");
        self.deliver(&others, ServerEvent::UserJoined {
            connection_id: conn.id,
            identity: conn.identity.clone(),
        });
        true
    }

    pub fn leave(&self, conn: &Connection, room_id: &str) -> bool {
        let remaining = {
            let mut joined = conn.rooms();
            if !joined.remove(room_id) {
                return false;
            }
            self.detach(conn.id, room_id)
        };

        tracing::info!(connection_id = %conn.id, room_id, "left room");
        self.deliver(&remaining, ServerEvent::UserLeft {
            connection_id: conn.id,
            identity: conn.identity.clone(),
        });
        true
    }

    /// Unregisters the connection and leaves every room it was in. Only the
    /// first call for a connection does anything; returns the rooms left.
    pub fn remove_connection(&self, id: ConnectionId) -> usize {
        let Some(conn) = self.registry.unregister(id) else {
            return 0;
        };

        let departures: Vec<(String, Vec<ConnectionId>)> = {
            let mut joined = conn.rooms();
            joined
                .drain()
                .map(|room_id| {
                    let remaining = self.detach(id, &room_id);
                    (room_id, remaining)
                })
                .collect()
        };

        for (room_id, remaining) in &departures {
            tracing::info!(connection_id = %id, room_id, "left room on disconnect");
            self.deliver(remaining, ServerEvent::UserLeft {
                connection_id: id,
                identity: conn.identity.clone(),
            });
        }
        departures.len()
    }

    /// Delivers to the members present when the call is made. Returns how
    /// many connections the event was queued for.
    pub fn broadcast(&self, room_id: &str, event: ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let members: Vec<ConnectionId> = match self.rooms.get(room_id) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|id| Some(*id) != exclude)
                .collect(),
            None => return 0,
        };

        self.deliver(&members, event)
    }

    pub fn route_signal(&self, envelope: SignalEnvelope) -> usize {
        let SignalEnvelope { from, to, data, room_id } = envelope;
        let event = ServerEvent::Signal { from, data };

        match (to, room_id) {
            // No membership check for direct signals.
            (Some(to), _) => self.deliver(&[to], event),
            (None, Some(room_id)) => self.broadcast(&room_id, event, Some(from)),
            (None, None) => {
                tracing::debug!(connection_id = %from, "dropping signal without target or room");
                0
            }
        }
    }

    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    // Caller holds the connection's joined-set lock.
    fn detach(&self, id: ConnectionId, room_id: &str) -> Vec<ConnectionId> {
        let remaining: Vec<ConnectionId> = match self.rooms.get_mut(room_id) {
            Some(mut members) => {
                members.remove(&id);
                members.iter().copied().collect()
            }
            None => Vec::new(),
        };

        if remaining.is_empty() {
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
        }
        remaining
    }

    fn deliver(&self, targets: &[ConnectionId], event: ServerEvent) -> usize {
        targets
            .iter()
            .filter_map(|id| self.registry.lookup(*id).ok())
            .filter(|conn| conn.send(event.clone()))
            .count()
    }
}
