//! devsync Runtime
//!
//! The execution bridge: translates a room's "run" intent plus its current
//! file-tree snapshot into process-lifecycle commands against an external,
//! sandboxed execution environment, and streams the output back.
//!
//! The bridge only reads snapshots; it never mutates room state.

use std::time::Duration;

use thiserror::Error;

pub mod environment;
pub mod local;
pub mod supervisor;

pub use environment::{ExecutionEnvironment, RunControl, RunningProcess};
pub use local::LocalEnvironment;
pub use supervisor::{CommandSpec, RunConfig, RunSupervisor};

/// Errors that can occur while driving the execution environment
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("file tree has no {0} manifest")]
    MissingManifest(String),

    #[error("failed to mount file tree: {0}")]
    MountFailed(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("install command exited with code {code:?}")]
    InstallFailed { code: Option<i32> },

    #[error("command timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("process communication error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events emitted by a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// A chunk of raw process output (stdout or stderr), line-oriented.
    Output { chunk: String },

    /// The spawned program started serving at a URL (live-preview signal).
    ServerReady { port: u16, url: String },

    /// The process exited. Terminal event for a run.
    Exited { code: Option<i32> },
}
