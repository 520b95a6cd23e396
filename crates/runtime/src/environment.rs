//! The injected execution-environment capability.
//!
//! The core depends only on this surface: mount a file tree, spawn a
//! command against it, consume the event stream, kill on demand. Tests
//! and alternative sandboxes implement the trait with fake handles.

use async_trait::async_trait;
use tokio::sync::mpsc;

use devsync_protocol::FileTree;

use crate::{RunEvent, RuntimeError};

/// Capability surface of an external, sandboxed execution environment.
///
/// All operations are scoped to a room: each room gets its own working
/// tree inside the environment, so runs for different rooms never see
/// each other's files.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Mount a file-tree snapshot into the room's working tree, replacing
    /// any previously mounted content at the same paths.
    async fn mount(&self, room_id: &str, tree: &FileTree) -> Result<(), RuntimeError>;

    /// Spawn a command inside the room's working tree.
    async fn spawn(
        &self,
        room_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<RunningProcess, RuntimeError>;
}

/// Kill switch for a spawned process. Cheap to clone; killing an already
/// exited process is a no-op.
#[derive(Debug, Clone)]
pub struct RunControl {
    kill_tx: mpsc::Sender<()>,
}

impl RunControl {
    pub fn new(kill_tx: mpsc::Sender<()>) -> Self {
        Self { kill_tx }
    }

    /// Request termination. The process's `Exited` event still arrives on
    /// its event stream once the kill takes effect.
    pub async fn kill(&self) {
        let _ = self.kill_tx.send(()).await;
    }
}

/// A process spawned inside the execution environment.
///
/// `events` yields `Output`/`ServerReady` events and terminates with a
/// single `Exited` event.
pub struct RunningProcess {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<RunEvent>,
    pub control: RunControl,
}

impl RunningProcess {
    pub fn new(pid: Option<u32>, events: mpsc::Receiver<RunEvent>, control: RunControl) -> Self {
        Self {
            pid,
            events,
            control,
        }
    }
}
