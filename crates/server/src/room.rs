//! Room state — the shared file tree plus the member fan-out list.
//!
//! A `Room` is owned exclusively by its actor task (see `room_actor`),
//! which is what serializes all mutation per room. Reads go through the
//! `ArcSwap` snapshot and never touch the actor.

use std::sync::Arc;

use arc_swap::ArcSwap;
use devsync_protocol::{FileTree, Member, ServerMessage};
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    conn_id: u64,
    member: Member,
    tx: mpsc::Sender<ServerMessage>,
}

/// One collaboration room: file-tree state and connected members.
pub struct Room {
    id: String,
    file_tree: FileTree,
    subscribers: Vec<Subscriber>,
    snapshot: Arc<ArcSwap<FileTree>>,
}

impl Room {
    /// Create a room, initialized empty or from a persisted snapshot.
    pub fn new(id: String, initial: FileTree) -> Self {
        let snapshot = Arc::new(ArcSwap::from_pointee(initial.clone()));
        Self {
            id,
            file_tree: initial,
            subscribers: Vec::new(),
            snapshot,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The lock-free snapshot cell, shared with the actor handle.
    pub fn snapshot_arc(&self) -> Arc<ArcSwap<FileTree>> {
        self.snapshot.clone()
    }

    pub fn file_tree(&self) -> &FileTree {
        &self.file_tree
    }

    pub fn member_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Register a member's outbound channel and announce the join to the
    /// rest of the room.
    pub async fn subscribe(&mut self, conn_id: u64, member: Member, tx: mpsc::Sender<ServerMessage>) {
        self.subscribers.push(Subscriber {
            conn_id,
            member: member.clone(),
            tx,
        });
        self.broadcast_except(conn_id, ServerMessage::MemberJoined { member })
            .await;
    }

    /// Remove a member. Idempotent; announces the leave to remaining members.
    pub async fn unsubscribe(&mut self, conn_id: u64) {
        let before = self.subscribers.len();
        let mut member_id = None;
        self.subscribers.retain(|s| {
            if s.conn_id == conn_id {
                member_id = Some(s.member.id.clone());
                false
            } else {
                true
            }
        });
        if self.subscribers.len() == before {
            return;
        }
        if let Some(member_id) = member_id {
            self.broadcast_all(ServerMessage::MemberLeft { member_id })
                .await;
        }
    }

    /// Apply an incoming tree with per-path replace semantics and publish
    /// a fresh snapshot. The incoming tree is already validated; paths it
    /// does not mention are left untouched.
    pub fn apply_tree(&mut self, incoming: FileTree) {
        debug!(
            component = "room",
            event = "room.tree.applied",
            room_id = %self.id,
            paths = incoming.len(),
            "Applied file tree update"
        );
        self.file_tree.merge_from(incoming);
        self.refresh_snapshot();
    }

    fn refresh_snapshot(&self) {
        self.snapshot.store(Arc::new(self.file_tree.clone()));
    }

    /// Broadcast to every member except `conn_id` (the sender never
    /// receives its own relayed echo).
    pub async fn broadcast_except(&mut self, conn_id: u64, msg: ServerMessage) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for sub in &self.subscribers {
            if sub.conn_id != conn_id {
                let _ = sub.tx.send(msg.clone()).await;
            }
        }
    }

    /// Broadcast to every member, including the initiator (run output,
    /// roster changes).
    pub async fn broadcast_all(&mut self, msg: ServerMessage) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for sub in &self.subscribers {
            let _ = sub.tx.send(msg.clone()).await;
        }
    }

    /// Send to a single member.
    pub async fn notify(&self, conn_id: u64, msg: ServerMessage) {
        if let Some(sub) = self.subscribers.iter().find(|s| s.conn_id == conn_id) {
            let _ = sub.tx.send(msg).await;
        }
    }
}
