//! Per-room actor.
//!
//! Each room runs one task that owns the `Room` and drains a command
//! channel. Every file-tree mutation for a room goes through this task,
//! which gives per-room serialization without locks; concurrent updates
//! land as a fold in channel arrival order. Snapshots are published to
//! an `ArcSwap` cell so reads never queue behind the actor.

use std::sync::Arc;

use arc_swap::ArcSwap;
use devsync_protocol::{codes, ChatBody, FileTree, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::persistence::PersistCommand;
use crate::room::Room;
use crate::room_command::RoomCommand;

/// Cloneable handle to a room actor.
#[derive(Clone)]
pub struct RoomActorHandle {
    id: String,
    command_tx: mpsc::Sender<RoomCommand>,
    snapshot: Arc<ArcSwap<FileTree>>,
}

impl RoomActorHandle {
    /// Spawn the actor task for `room` and return its handle.
    pub fn spawn(room: Room, persist_tx: mpsc::Sender<PersistCommand>) -> Self {
        let id = room.id().to_string();
        let snapshot = room.snapshot_arc();
        let (command_tx, command_rx) = mpsc::channel(256);

        tokio::spawn(actor_loop(room, command_rx, persist_tx));

        Self {
            id,
            command_tx,
            snapshot,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send(&self, cmd: RoomCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "room_actor",
                event = "room.command.dropped",
                room_id = %self.id,
                "Room actor is gone; command dropped"
            );
        }
    }

    /// Current tree snapshot, without going through the actor.
    pub fn snapshot(&self) -> Arc<FileTree> {
        self.snapshot.load_full()
    }
}

async fn actor_loop(
    mut room: Room,
    mut command_rx: mpsc::Receiver<RoomCommand>,
    persist_tx: mpsc::Sender<PersistCommand>,
) {
    info!(
        component = "room_actor",
        event = "room.started",
        room_id = %room.id(),
        "Room actor started"
    );
    while let Some(cmd) = command_rx.recv().await {
        handle_room_command(&mut room, cmd, &persist_tx).await;
    }
    info!(
        component = "room_actor",
        event = "room.stopped",
        room_id = %room.id(),
        "Room actor stopped"
    );
}

async fn handle_room_command(
    room: &mut Room,
    cmd: RoomCommand,
    persist_tx: &mpsc::Sender<PersistCommand>,
) {
    match cmd {
        RoomCommand::Subscribe {
            conn_id,
            member,
            tx,
        } => {
            debug!(
                component = "room_actor",
                event = "room.member.joined",
                room_id = %room.id(),
                member_id = %member.id,
            );
            room.subscribe(conn_id, member, tx).await;
        }
        RoomCommand::Unsubscribe { conn_id } => {
            room.unsubscribe(conn_id).await;
        }
        RoomCommand::Chat {
            conn_id,
            sender,
            body,
        } => {
            match ChatBody::decode(&body) {
                Ok(ChatBody::FileTreeUpdate { file_tree, .. }) => {
                    room.apply_tree(file_tree);
                }
                Ok(ChatBody::Text(_)) => {}
                Err(err) => {
                    // The payload claimed a file tree but failed
                    // validation. Room state stays as-is; the sender
                    // learns why, and the chat still relays below.
                    warn!(
                        component = "room_actor",
                        event = "room.tree.rejected",
                        room_id = %room.id(),
                        sender = %sender,
                        error = %err,
                        "Rejected invalid file tree in chat body"
                    );
                    room.notify(
                        conn_id,
                        ServerMessage::error(codes::INVALID_FILE_TREE, err.to_string()),
                    )
                    .await;
                }
            }
            // Relay the envelope verbatim to everyone but the sender,
            // whatever the body turned out to contain.
            room.broadcast_except(conn_id, ServerMessage::Chat { sender, body })
                .await;
        }
        RoomCommand::Broadcast { msg } => {
            room.broadcast_all(msg).await;
        }
        RoomCommand::Save { reply } => {
            let cmd = PersistCommand::SaveTree {
                room_id: room.id().to_string(),
                file_tree: room.file_tree().clone(),
                reply,
            };
            if let Err(mpsc::error::SendError(PersistCommand::SaveTree { reply, .. })) =
                persist_tx.send(cmd).await
            {
                let _ = reply.send(Err("persistence writer is gone".to_string()));
            }
        }
    }
}
