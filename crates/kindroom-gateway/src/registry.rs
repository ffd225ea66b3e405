use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, warn};
use uuid::Uuid;

use kindroom_types::events::ServerEvent;
use kindroom_types::models::RoomId;

pub type ConnId = Uuid;

/// A serialized event, shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections removed because their queue was closed or full
    pub evicted: Vec<ConnId>,
}

/// Tracks which live connections are subscribed to which room.
///
/// Each room has its own lock; the outer map is only touched to find or
/// create a room. No lock is held across an await point.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    rooms: DashMap<RoomId, Arc<RoomMembers>>,
}

#[derive(Default)]
struct RoomMembers {
    subscribers: RwLock<HashMap<ConnId, mpsc::Sender<Frame>>>,
}

impl RoomMembers {
    fn insert(&self, conn_id: ConnId, tx: mpsc::Sender<Frame>) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn_id, tx);
    }

    fn remove(&self, conn_id: &ConnId) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn_id)
            .is_some()
    }

    fn is_empty(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under a room. Joining again with the same
    /// `conn_id` replaces its queue, so it is never delivered to twice.
    pub fn join(&self, room_id: RoomId, conn_id: ConnId, tx: mpsc::Sender<Frame>) {
        // Insert while holding the map entry so a concurrent `leave` cannot
        // drop the room between lookup and insert.
        let room = self.inner.rooms.entry(room_id).or_default();
        room.insert(conn_id, tx);
    }

    /// Remove a connection from a room. Unknown rooms and connections are a no-op.
    pub fn leave(&self, room_id: RoomId, conn_id: ConnId) -> bool {
        let removed = match self.inner.rooms.get(&room_id) {
            Some(room) => room.remove(&conn_id),
            None => false,
        };
        self.inner.rooms.remove_if(&room_id, |_, room| room.is_empty());
        removed
    }

    /// Deliver `event` to every connection in the room, except `exclude`.
    ///
    /// Delivery never waits: a connection whose queue is closed or full is
    /// evicted from the room and the others still receive the event.
    pub fn broadcast(
        &self,
        room_id: RoomId,
        event: &ServerEvent,
        exclude: Option<ConnId>,
    ) -> BroadcastReport {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, room_id, "Failed to serialize broadcast event");
                return BroadcastReport::default();
            }
        };

        let Some(room) = self.inner.rooms.get(&room_id).map(|r| r.value().clone()) else {
            return BroadcastReport::default();
        };

        let mut report = BroadcastReport::default();
        {
            let subscribers = room.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for (conn_id, tx) in subscribers.iter() {
                if Some(*conn_id) == exclude {
                    continue;
                }
                match tx.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(%conn_id, room_id, "Outbound queue full, evicting connection");
                        report.evicted.push(*conn_id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(%conn_id, room_id, "Connection gone, evicting");
                        report.evicted.push(*conn_id);
                    }
                }
            }
        }

        for conn_id in &report.evicted {
            room.remove(conn_id);
        }
        if !report.evicted.is_empty() {
            self.inner.rooms.remove_if(&room_id, |_, room| room.is_empty());
        }

        report
    }

    /// Connections currently registered under a room.
    pub fn members(&self, room_id: RoomId) -> Vec<ConnId> {
        self.inner
            .rooms
            .get(&room_id)
            .map(|room| {
                room.subscribers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .keys()
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, room_id: RoomId, conn_id: ConnId) -> bool {
        self.members(room_id).contains(&conn_id)
    }

    /// Rooms with at least one connection.
    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Drop every registration. Each connection's queue closes, which ends
    /// its writer. Called at shutdown.
    pub fn close_all(&self) {
        self.inner.rooms.clear();
    }
}
