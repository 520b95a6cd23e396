//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
///
/// The room is bound at connect time, so no message carries a room id —
/// a connection belongs to exactly one room for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A chat envelope. `body` is polymorphic: plain text, or a structured
    /// payload carrying a `fileTree` snapshot (see `ChatBody::decode`).
    Chat { sender: String, body: Value },

    /// Request the current file-tree snapshot (join/reconnect, pre-mount).
    FetchSnapshot,

    /// Persist the current file tree to the external project store.
    /// Explicit save only; edits are never persisted automatically.
    SaveFileTree,

    /// Run intent: mount the current snapshot, install dependencies, then
    /// start the program, replacing any active run for the room.
    Run,

    /// Terminate the active run, if any.
    StopRun,
}
