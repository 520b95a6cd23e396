//! Asynchronous persistence pipeline.
//!
//! Explicit saves are forwarded from room actors to a single writer task
//! over a channel, so a slow or failing store never blocks message relay.
//! The store itself is pluggable; the default is an HTTP store that
//! mirrors the project API's file-tree endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use devsync_protocol::FileTree;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Commands accepted by the persistence writer task.
pub enum PersistCommand {
    SaveTree {
        room_id: String,
        file_tree: FileTree,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(256)
}

/// Backing store for room file trees.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save_tree(&self, room_id: &str, tree: &FileTree) -> anyhow::Result<()>;

    /// `Ok(None)` means the store does not know the project.
    async fn load_tree(&self, room_id: &str) -> anyhow::Result<Option<FileTree>>;
}

#[derive(Serialize)]
struct SaveTreeRequest<'a> {
    room_id: &'a str,
    file_tree: &'a FileTree,
}

#[derive(Deserialize)]
struct LoadTreeResponse {
    file_tree: FileTree,
}

/// Store backed by an external HTTP project service.
pub struct HttpProjectStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProjectStore for HttpProjectStore {
    async fn save_tree(&self, room_id: &str, tree: &FileTree) -> anyhow::Result<()> {
        let url = format!("{}/projects/file-tree", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&SaveTreeRequest {
                room_id,
                file_tree: tree,
            })
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }

    async fn load_tree(&self, room_id: &str) -> anyhow::Result<Option<FileTree>> {
        let url = format!("{}/projects/{}/file-tree", self.base_url, room_id);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: LoadTreeResponse = response.error_for_status()?.json().await?;
        Ok(Some(body.file_tree))
    }
}

/// Background task draining [`PersistCommand`]s into the store.
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    store: Option<Arc<dyn ProjectStore>>,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, store: Option<Arc<dyn ProjectStore>>) -> Self {
        Self { rx, store }
    }

    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.writer.started",
            has_store = self.store.is_some(),
            "Persistence writer started"
        );
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                PersistCommand::SaveTree {
                    room_id,
                    file_tree,
                    reply,
                } => {
                    let result = self.save(&room_id, &file_tree).await;
                    if let Err(err) = &result {
                        error!(
                            component = "persistence",
                            event = "persistence.save.failed",
                            room_id = %room_id,
                            error = %err,
                            "Failed to persist file tree"
                        );
                    } else {
                        debug!(
                            component = "persistence",
                            event = "persistence.save.ok",
                            room_id = %room_id,
                            paths = file_tree.len(),
                        );
                    }
                    if reply.send(result).is_err() {
                        warn!(
                            component = "persistence",
                            event = "persistence.reply.dropped",
                            room_id = %room_id,
                            "Save requester went away before the reply"
                        );
                    }
                }
            }
        }
        info!(
            component = "persistence",
            event = "persistence.writer.stopped",
            "Persistence writer stopped"
        );
    }

    async fn save(&self, room_id: &str, tree: &FileTree) -> Result<(), String> {
        let Some(store) = &self.store else {
            return Err("no project store configured".to_string());
        };
        store
            .save_tree(room_id, tree)
            .await
            .map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsync_protocol::FileNode;
    use std::sync::Mutex;

    struct MemoryStore {
        saved: Mutex<Vec<(String, FileTree)>>,
        fail: bool,
    }

    impl MemoryStore {
        fn new(fail: bool) -> Self {
            Self {
                saved: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl ProjectStore for MemoryStore {
        async fn save_tree(&self, room_id: &str, tree: &FileTree) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("store offline");
            }
            self.saved
                .lock()
                .unwrap()
                .push((room_id.to_string(), tree.clone()));
            Ok(())
        }

        async fn load_tree(&self, _room_id: &str) -> anyhow::Result<Option<FileTree>> {
            Ok(None)
        }
    }

    fn sample_tree() -> FileTree {
        let mut tree = FileTree::new();
        tree.insert("index.js", FileNode::file("a"));
        tree
    }

    #[tokio::test]
    async fn save_reaches_the_store_and_acks() {
        let store = Arc::new(MemoryStore::new(false));
        let (tx, rx) = create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(rx, Some(store.clone())).run());

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::SaveTree {
            room_id: "p1".to_string(),
            file_tree: sample_tree(),
            reply: reply_tx,
        })
        .await
        .unwrap();

        assert!(reply_rx.await.unwrap().is_ok());
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "p1");
    }

    #[tokio::test]
    async fn store_failure_is_reported_to_the_requester() {
        let store = Arc::new(MemoryStore::new(true));
        let (tx, rx) = create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(rx, Some(store)).run());

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::SaveTree {
            room_id: "p1".to_string(),
            file_tree: sample_tree(),
            reply: reply_tx,
        })
        .await
        .unwrap();

        let result = reply_rx.await.unwrap();
        assert!(result.unwrap_err().contains("store offline"));
    }

    #[tokio::test]
    async fn missing_store_fails_saves_without_panicking() {
        let (tx, rx) = create_persistence_channel();
        tokio::spawn(PersistenceWriter::new(rx, None).run());

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::SaveTree {
            room_id: "p1".to_string(),
            file_tree: sample_tree(),
            reply: reply_tx,
        })
        .await
        .unwrap();

        assert!(reply_rx.await.unwrap().is_err());
    }
}
