//! Local-process execution environment.
//!
//! Mounts file trees into a scratch directory and spawns commands with
//! `tokio::process`, forwarding line-oriented output as run events. This is
//! the default environment; sandboxed alternatives implement the same trait.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use devsync_protocol::{FileNode, FileTree};

use crate::environment::{ExecutionEnvironment, RunControl, RunningProcess};
use crate::{RunEvent, RuntimeError};

const EVENT_BUFFER_SIZE: usize = 256;

/// Execution environment backed by a scratch directory on the local host.
/// Each room gets its own subdirectory; rooms never share a working tree.
pub struct LocalEnvironment {
    workdir: TempDir,
}

impl LocalEnvironment {
    pub fn new() -> Result<Self, RuntimeError> {
        let workdir = tempfile::tempdir()?;
        Ok(Self { workdir })
    }

    /// The working tree for a room.
    pub fn room_dir(&self, room_id: &str) -> PathBuf {
        self.workdir.path().join(room_dir_name(room_id))
    }
}

/// Room ids are opaque external strings; map them to a safe directory
/// name so no id can escape the scratch root.
fn room_dir_name(room_id: &str) -> String {
    room_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
impl ExecutionEnvironment for LocalEnvironment {
    async fn mount(&self, room_id: &str, tree: &FileTree) -> Result<(), RuntimeError> {
        let root = self.room_dir(room_id);
        let tree = tree.clone();
        let path = root.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            write_tree(&root, &tree)
        })
        .await
        .map_err(|e| RuntimeError::MountFailed(e.to_string()))?
        .map_err(|e| RuntimeError::MountFailed(e.to_string()))?;
        debug!(
            component = "runtime",
            event = "env.mounted",
            room_id = %room_id,
            path = %path.display(),
            "Mounted file tree"
        );
        Ok(())
    }

    async fn spawn(
        &self,
        room_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<RunningProcess, RuntimeError> {
        let room_dir = self.room_dir(room_id);
        std::fs::create_dir_all(&room_dir)?;
        let mut child = Command::new(command)
            .args(args)
            .current_dir(&room_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(format!("{command}: {e}")))?;

        let pid = child.id();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        let ready_seen = Arc::new(AtomicBool::new(false));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|s| {
            tokio::spawn(forward_lines(s, event_tx.clone(), ready_seen.clone()))
        });
        let err_task = stderr.map(|s| {
            tokio::spawn(forward_lines(s, event_tx.clone(), ready_seen.clone()))
        });

        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    Some(_) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                    status = child.wait() => break status,
                }
            };

            // Drain output before reporting exit so Exited stays terminal.
            if let Some(task) = out_task {
                let _ = task.await;
            }
            if let Some(task) = err_task {
                let _ = task.await;
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(
                        component = "runtime",
                        event = "env.wait_failed",
                        error = %e,
                        "Failed to reap child process"
                    );
                    None
                }
            };
            let _ = event_tx.send(RunEvent::Exited { code }).await;
        });

        Ok(RunningProcess::new(pid, event_rx, RunControl::new(kill_tx)))
    }
}

/// Write a file tree under `root`, creating parent directories as needed.
fn write_tree(root: &Path, tree: &FileTree) -> std::io::Result<()> {
    for (path, node) in tree.iter() {
        let target = root.join(path);
        match node {
            FileNode::File { file } => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, &file.contents)?;
            }
            FileNode::Directory { directory } => {
                std::fs::create_dir_all(&target)?;
                write_tree(&target, directory)?;
            }
        }
    }
    Ok(())
}

async fn forward_lines(
    stream: impl AsyncRead + Unpin,
    tx: mpsc::Sender<RunEvent>,
    ready_seen: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some((port, url)) = detect_ready_url(&line) {
            if !ready_seen.swap(true, Ordering::SeqCst)
                && tx.send(RunEvent::ServerReady { port, url }).await.is_err()
            {
                return;
            }
        }
        if tx.send(RunEvent::Output { chunk: line }).await.is_err() {
            return;
        }
    }
}

/// Scan a line of process output for a served URL ("server-ready" signal).
fn detect_ready_url(line: &str) -> Option<(u16, String)> {
    let start = line.find("http://").or_else(|| line.find("https://"))?;
    let url: &str = line[start..]
        .split(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .next()?;
    let url = url.trim_end_matches(|c: char| matches!(c, '.' | ',' | ')' | ']' | '>'));

    let rest = url.split("://").nth(1)?;
    let host_port = rest.split('/').next()?;
    let port = match host_port.rsplit_once(':') {
        Some((_, port)) => port.parse().ok()?,
        None if url.starts_with("https://") => 443,
        None => 80,
    };
    Some((port, url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ready_url_with_port() {
        let (port, url) = detect_ready_url("Server running at http://localhost:3000/ press ^C")
            .expect("url detected");
        assert_eq!(port, 3000);
        assert_eq!(url, "http://localhost:3000/");
    }

    #[test]
    fn detects_ready_url_default_ports() {
        assert_eq!(
            detect_ready_url("serving https://example.dev"),
            Some((443, "https://example.dev".to_string()))
        );
        assert_eq!(
            detect_ready_url("listening on http://127.0.0.1"),
            Some((80, "http://127.0.0.1".to_string()))
        );
    }

    #[test]
    fn ignores_lines_without_urls() {
        assert_eq!(detect_ready_url("compiled 12 modules"), None);
        assert_eq!(detect_ready_url("npm WARN deprecated"), None);
    }

    #[test]
    fn writes_nested_tree_to_disk() {
        let mut src = FileTree::new();
        src.insert("main.js", FileNode::file("console.log(1)"));
        let mut tree = FileTree::new();
        tree.insert("package.json", FileNode::file("{}"));
        tree.insert("src", FileNode::Directory { directory: src });

        let dir = tempfile::tempdir().expect("tempdir");
        write_tree(dir.path(), &tree).expect("write tree");

        assert_eq!(
            std::fs::read_to_string(dir.path().join("package.json")).expect("read"),
            "{}"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/main.js")).expect("read"),
            "console.log(1)"
        );
    }

    #[tokio::test]
    async fn mounts_for_different_rooms_are_isolated() {
        let env = LocalEnvironment::new().expect("environment");

        let mut tree_a = FileTree::new();
        tree_a.insert("index.js", FileNode::file("room-a"));
        env.mount("p1", &tree_a).await.expect("mount p1");

        let mut tree_b = FileTree::new();
        tree_b.insert("index.js", FileNode::file("room-b"));
        env.mount("p2", &tree_b).await.expect("mount p2");

        // The second room's mount must not touch the first room's tree.
        let mut process = env
            .spawn("p1", "cat", &["index.js".to_string()])
            .await
            .expect("spawn cat");
        let mut output = Vec::new();
        while let Some(event) = process.events.recv().await {
            if let RunEvent::Output { chunk } = event {
                output.push(chunk);
            }
        }
        assert_eq!(output, vec!["room-a".to_string()]);
        assert_eq!(
            std::fs::read_to_string(env.room_dir("p2").join("index.js")).expect("read p2"),
            "room-b"
        );
    }

    #[test]
    fn room_dir_names_cannot_escape_the_scratch_root() {
        assert_eq!(room_dir_name("proj-42_a"), "proj-42_a");
        assert_eq!(room_dir_name("../etc"), "---etc");
        assert_eq!(room_dir_name("a/b"), "a-b");
    }

    #[tokio::test]
    async fn spawn_streams_output_and_exit() {
        let env = LocalEnvironment::new().expect("environment");
        let mut process = env
            .spawn("p1", "echo", &["hello".to_string()])
            .await
            .expect("spawn echo");

        let mut saw_output = false;
        let mut exit_code = None;
        while let Some(event) = process.events.recv().await {
            match event {
                RunEvent::Output { chunk } => {
                    assert_eq!(chunk, "hello");
                    saw_output = true;
                }
                RunEvent::Exited { code } => exit_code = code,
                RunEvent::ServerReady { .. } => panic!("no ready signal expected"),
            }
        }
        assert!(saw_output);
        assert_eq!(exit_code, Some(0));
    }

    #[tokio::test]
    async fn kill_terminates_the_process() {
        let env = LocalEnvironment::new().expect("environment");
        let mut process = env
            .spawn("p1", "sleep", &["30".to_string()])
            .await
            .expect("spawn sleep");

        process.control.kill().await;

        let mut exited = false;
        while let Some(event) = process.events.recv().await {
            if let RunEvent::Exited { code } = event {
                // Killed by signal, so no exit code.
                assert_eq!(code, None);
                exited = true;
            }
        }
        assert!(exited);
    }
}
