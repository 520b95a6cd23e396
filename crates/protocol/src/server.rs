//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{FileTree, Member};

/// Wire error codes used in `ServerMessage::Error`.
pub mod codes {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const ROOM_UNAVAILABLE: &str = "room_unavailable";
    pub const INVALID_FILE_TREE: &str = "invalid_file_tree";
    pub const MISSING_MANIFEST: &str = "missing_manifest";
    pub const EXECUTION_FAILURE: &str = "execution_failure";
    pub const EXECUTION_TIMEOUT: &str = "execution_timeout";
    pub const PERSIST_FAILURE: &str = "persist_failure";
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A relayed chat envelope, body unmodified from the sender's wire form.
    Chat { sender: String, body: Value },

    /// Current file-tree state for the room.
    Snapshot { file_tree: FileTree },

    // Roster
    Members { members: Vec<Member> },
    MemberJoined { member: Member },
    MemberLeft { member_id: String },

    /// Explicit save acknowledged by the external project store.
    /// Sent to the initiating member only.
    Saved,

    // Run lifecycle. Process output itself travels as `Chat` from the
    // assistant sender, see [`ServerMessage::system_chat`].
    RunReady { port: u16, url: String },
    RunExited { code: Option<i32> },

    /// Non-fatal error surfaced to one member.
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// A server-authored chat message, e.g. a line of run output.
    pub fn system_chat(text: impl Into<String>) -> Self {
        Self::Chat {
            sender: crate::types::ASSISTANT_ID.to_string(),
            body: Value::String(text.into()),
        }
    }
}
