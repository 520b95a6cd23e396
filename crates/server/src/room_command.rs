//! Commands accepted by a room actor.

use devsync_protocol::{Member, ServerMessage};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub enum RoomCommand {
    /// Attach a member's outbound channel to the room.
    Subscribe {
        conn_id: u64,
        member: Member,
        tx: mpsc::Sender<ServerMessage>,
    },
    /// Detach a member. Safe to send more than once.
    Unsubscribe { conn_id: u64 },
    /// A chat envelope from a connected member. The body is kept as raw
    /// JSON so the relay is verbatim even when the payload also carries
    /// a file-tree update.
    Chat {
        conn_id: u64,
        sender: String,
        body: Value,
    },
    /// Fan a server-originated message out to every member (run output,
    /// run lifecycle).
    Broadcast { msg: ServerMessage },
    /// Persist the current tree through the writer task.
    Save {
        reply: oneshot::Sender<Result<(), String>>,
    },
}
