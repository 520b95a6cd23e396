//! Shared server state: the room registry and connection bookkeeping.

use std::sync::Arc;

use dashmap::DashMap;
use devsync_protocol::{is_reserved_member_id, FileTree, Member};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::persistence::{PersistCommand, ProjectStore};
use crate::room::Room;
use crate::room_actor::RoomActorHandle;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("room unavailable: {0}")]
    RoomUnavailable(String),
}

#[derive(Clone)]
pub struct ConnectionEntry {
    pub room_id: String,
    pub member: Member,
}

/// Registry of live rooms and the connections attached to them.
///
/// Rooms are created lazily on first join and retained after the last
/// member leaves, so a rejoin sees the same tree the room had.
pub struct RoomRegistry {
    rooms: DashMap<String, RoomActorHandle>,
    connections: DashMap<u64, ConnectionEntry>,
    persist_tx: mpsc::Sender<PersistCommand>,
    store: Option<Arc<dyn ProjectStore>>,
}

impl RoomRegistry {
    pub fn new(
        persist_tx: mpsc::Sender<PersistCommand>,
        store: Option<Arc<dyn ProjectStore>>,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            persist_tx,
            store,
        }
    }

    /// Get the room's actor handle, spawning the actor on first join.
    ///
    /// With a store configured, an unknown project is a join error; the
    /// store deciding what exists is what keeps rooms from being typo
    /// factories. Without a store every room id is valid and starts
    /// empty.
    pub async fn ensure_room(&self, room_id: &str) -> Result<RoomActorHandle, JoinError> {
        if let Some(handle) = self.rooms.get(room_id) {
            return Ok(handle.value().clone());
        }

        let initial = match &self.store {
            Some(store) => match store.load_tree(room_id).await {
                Ok(Some(tree)) => tree,
                Ok(None) => {
                    return Err(JoinError::RoomUnavailable(format!(
                        "unknown project {room_id}"
                    )));
                }
                Err(err) => {
                    error!(
                        component = "registry",
                        event = "registry.load.failed",
                        room_id = %room_id,
                        error = %err,
                        "Project store lookup failed"
                    );
                    return Err(JoinError::RoomUnavailable(format!(
                        "project store unavailable: {err}"
                    )));
                }
            },
            None => FileTree::new(),
        };

        let handle = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!(
                    component = "registry",
                    event = "registry.room.created",
                    room_id = %room_id,
                    "Created room"
                );
                RoomActorHandle::spawn(
                    Room::new(room_id.to_string(), initial),
                    self.persist_tx.clone(),
                )
            })
            .value()
            .clone();
        Ok(handle)
    }

    /// Record a connection's identity. The assistant id is reserved for
    /// server-originated messages and cannot be claimed by a client.
    pub fn register(&self, conn_id: u64, room_id: &str, member: Member) -> Result<(), JoinError> {
        if is_reserved_member_id(&member.id) {
            warn!(
                component = "registry",
                event = "registry.join.rejected",
                room_id = %room_id,
                member_id = %member.id,
                "Rejected reserved member id"
            );
            return Err(JoinError::Unauthorized(format!(
                "member id {:?} is reserved",
                member.id
            )));
        }
        self.connections.insert(
            conn_id,
            ConnectionEntry {
                room_id: room_id.to_string(),
                member,
            },
        );
        Ok(())
    }

    /// Drop a connection's bookkeeping. Idempotent.
    pub fn unregister(&self, conn_id: u64) -> Option<ConnectionEntry> {
        self.connections.remove(&conn_id).map(|(_, entry)| entry)
    }

    /// Current roster of a room, for the join-time member list.
    pub fn members_of(&self, room_id: &str) -> Vec<Member> {
        self.connections
            .iter()
            .filter(|entry| entry.room_id == room_id)
            .map(|entry| entry.member.clone())
            .collect()
    }
}
