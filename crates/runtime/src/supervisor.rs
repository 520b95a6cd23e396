//! Run supervisor — at most one active run per room.
//!
//! `prepare` mounts the room's snapshot and installs dependencies;
//! `start` spawns the program, terminating any previous run for the room
//! first (replace-on-run). Output events are forwarded to the caller's
//! channel for broadcast as chat-visible system messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use devsync_protocol::FileTree;

use crate::environment::{ExecutionEnvironment, RunControl};
use crate::{RunEvent, RuntimeError};

/// A command to execute inside the environment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Execution bridge configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Manifest file that must exist before a run can be prepared.
    pub manifest: String,
    pub install: CommandSpec,
    pub start: CommandSpec,
    /// Budget for the whole install command.
    pub install_timeout: Duration,
    /// Budget for spawning the start command (not for the run itself,
    /// which is unbounded while active).
    pub spawn_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            manifest: "package.json".to_string(),
            install: CommandSpec::new("npm", &["install"]),
            start: CommandSpec::new("npm", &["start"]),
            install_timeout: Duration::from_secs(300),
            spawn_timeout: Duration::from_secs(30),
        }
    }
}

struct ActiveRun {
    generation: u64,
    control: RunControl,
}

/// Drives the execution environment on behalf of rooms.
///
/// Reads snapshots only; never mutates room state.
pub struct RunSupervisor {
    env: Arc<dyn ExecutionEnvironment>,
    config: RunConfig,
    active: Arc<DashMap<String, ActiveRun>>,
    // Installs in flight, kept apart from `active` so registering one
    // does not displace a still-live previous run before `start` gets to
    // terminate it.
    installing: DashMap<String, ActiveRun>,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
    next_generation: AtomicU64,
}

impl RunSupervisor {
    pub fn new(env: Arc<dyn ExecutionEnvironment>, config: RunConfig) -> Self {
        Self {
            env,
            config,
            active: Arc::new(DashMap::new()),
            installing: DashMap::new(),
            run_locks: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Full run intent: prepare then start, serialized per room so two
    /// concurrent run requests cannot interleave their install/start phases.
    pub async fn run(
        &self,
        room_id: &str,
        tree: &FileTree,
        output: mpsc::Sender<RunEvent>,
    ) -> Result<(), RuntimeError> {
        let lock = self
            .run_locks
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        self.prepare(room_id, tree, &output).await?;
        self.start(room_id, output).await
    }

    /// Mount the snapshot and install dependencies, streaming install
    /// output. Fails with `MissingManifest` before any command is issued
    /// if the tree lacks the manifest file.
    ///
    /// The install is registered as in flight while it lasts, so `stop`
    /// can abort a run that has not reached its start phase yet.
    pub async fn prepare(
        &self,
        room_id: &str,
        tree: &FileTree,
        output: &mpsc::Sender<RunEvent>,
    ) -> Result<(), RuntimeError> {
        if !tree.contains(&self.config.manifest) {
            return Err(RuntimeError::MissingManifest(self.config.manifest.clone()));
        }

        self.env.mount(room_id, tree).await?;

        let install = &self.config.install;
        let mut process = self
            .env
            .spawn(room_id, &install.program, &install.args)
            .await?;
        info!(
            component = "runtime",
            event = "run.install.started",
            room_id = %room_id,
            pid = ?process.pid,
            "Install started"
        );

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.installing.insert(
            room_id.to_string(),
            ActiveRun {
                generation,
                control: process.control.clone(),
            },
        );

        let deadline = tokio::time::Instant::now() + self.config.install_timeout;
        let result = loop {
            match tokio::time::timeout_at(deadline, process.events.recv()).await {
                Err(_) => {
                    process.control.kill().await;
                    warn!(
                        component = "runtime",
                        event = "run.install.timeout",
                        room_id = %room_id,
                        "Install timed out"
                    );
                    break Err(RuntimeError::ExecutionTimeout(self.config.install_timeout));
                }
                Ok(None) => break Err(RuntimeError::InstallFailed { code: None }),
                Ok(Some(RunEvent::Exited { code })) => {
                    if code == Some(0) {
                        info!(
                            component = "runtime",
                            event = "run.install.completed",
                            room_id = %room_id,
                            "Install completed"
                        );
                        break Ok(());
                    }
                    break Err(RuntimeError::InstallFailed { code });
                }
                Ok(Some(event)) => {
                    let _ = output.send(event).await;
                }
            }
        };

        // Clear our own entry only; a stop may already have removed it.
        self.installing
            .remove_if(room_id, |_, run| run.generation == generation);
        result
    }

    /// Spawn the start command, replacing any active run for the room.
    /// Output is forwarded on `output` until the process exits.
    pub async fn start(
        &self,
        room_id: &str,
        output: mpsc::Sender<RunEvent>,
    ) -> Result<(), RuntimeError> {
        // Replace-on-run: terminate the previous run before spawning.
        if let Some((_, prev)) = self.active.remove(room_id) {
            info!(
                component = "runtime",
                event = "run.replaced",
                room_id = %room_id,
                "Terminating previous run"
            );
            prev.control.kill().await;
        }

        let start = &self.config.start;
        let process = tokio::time::timeout(
            self.config.spawn_timeout,
            self.env.spawn(room_id, &start.program, &start.args),
        )
        .await
        .map_err(|_| RuntimeError::ExecutionTimeout(self.config.spawn_timeout))??;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            room_id.to_string(),
            ActiveRun {
                generation,
                control: process.control.clone(),
            },
        );
        info!(
            component = "runtime",
            event = "run.started",
            room_id = %room_id,
            pid = ?process.pid,
            "Run started"
        );

        let active = self.active.clone();
        let room = room_id.to_string();
        let mut events = process.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let exited = matches!(event, RunEvent::Exited { .. });
                let _ = output.send(event).await;
                if exited {
                    break;
                }
            }
            // Only clear our own entry; a newer run may have replaced it.
            active.remove_if(&room, |_, run| run.generation == generation);
        });

        Ok(())
    }

    /// Terminate the active run for a room, if any, including a run still
    /// in its install phase. Returns whether anything was stopped.
    pub async fn stop(&self, room_id: &str) -> bool {
        let mut stopped = false;
        if let Some((_, install)) = self.installing.remove(room_id) {
            install.control.kill().await;
            stopped = true;
        }
        if let Some((_, run)) = self.active.remove(room_id) {
            run.control.kill().await;
            stopped = true;
        }
        if stopped {
            info!(
                component = "runtime",
                event = "run.stopped",
                room_id = %room_id,
                "Run stopped"
            );
        }
        stopped
    }

    pub fn has_active(&self, room_id: &str) -> bool {
        self.active.contains_key(room_id) || self.installing.contains_key(room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::RunningProcess;
    use async_trait::async_trait;
    use devsync_protocol::FileNode;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    /// Fake environment: install commands exit with a configured code,
    /// everything else runs until killed.
    struct FakeEnvironment {
        mounts: StdMutex<Vec<(String, FileTree)>>,
        spawns: StdMutex<Vec<String>>,
        install_exit: i32,
        hang_install: bool,
        kills: Arc<AtomicUsize>,
    }

    impl FakeEnvironment {
        fn new() -> Self {
            Self {
                mounts: StdMutex::new(Vec::new()),
                spawns: StdMutex::new(Vec::new()),
                install_exit: 0,
                hang_install: false,
                kills: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn mount_count(&self) -> usize {
            self.mounts.lock().unwrap().len()
        }

        fn spawned(&self) -> Vec<String> {
            self.spawns.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutionEnvironment for FakeEnvironment {
        async fn mount(&self, room_id: &str, tree: &FileTree) -> Result<(), RuntimeError> {
            self.mounts
                .lock()
                .unwrap()
                .push((room_id.to_string(), tree.clone()));
            Ok(())
        }

        async fn spawn(
            &self,
            room_id: &str,
            command: &str,
            args: &[String],
        ) -> Result<RunningProcess, RuntimeError> {
            self.spawns
                .lock()
                .unwrap()
                .push(format!("{room_id}: {} {}", command, args.join(" ")));

            let (event_tx, event_rx) = mpsc::channel(16);
            let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
            let is_install = args.iter().any(|a| a == "install");

            if is_install && !self.hang_install {
                let code = self.install_exit;
                tokio::spawn(async move {
                    let _ = event_tx
                        .send(RunEvent::Output {
                            chunk: "added 1 package".to_string(),
                        })
                        .await;
                    let _ = event_tx.send(RunEvent::Exited { code: Some(code) }).await;
                });
            } else {
                let kills = self.kills.clone();
                tokio::spawn(async move {
                    let _ = event_tx
                        .send(RunEvent::Output {
                            chunk: "starting".to_string(),
                        })
                        .await;
                    if kill_rx.recv().await.is_some() {
                        kills.fetch_add(1, Ordering::SeqCst);
                        let _ = event_tx.send(RunEvent::Exited { code: None }).await;
                    }
                });
            }

            Ok(RunningProcess::new(
                Some(42),
                event_rx,
                RunControl::new(kill_tx),
            ))
        }
    }

    fn tree_with_manifest() -> FileTree {
        let mut tree = FileTree::new();
        tree.insert("package.json", FileNode::file("{}"));
        tree.insert("index.js", FileNode::file("require('http')"));
        tree
    }

    fn supervisor_with(
        env: Arc<FakeEnvironment>,
        config: RunConfig,
    ) -> RunSupervisor {
        RunSupervisor::new(env, config)
    }

    #[tokio::test]
    async fn prepare_fails_without_manifest_and_issues_no_commands() {
        let env = Arc::new(FakeEnvironment::new());
        let supervisor = supervisor_with(env.clone(), RunConfig::default());
        let (tx, _rx) = mpsc::channel(16);

        let err = supervisor
            .prepare("p1", &FileTree::new(), &tx)
            .await
            .expect_err("missing manifest");
        assert!(matches!(err, RuntimeError::MissingManifest(_)));
        assert_eq!(env.mount_count(), 0);
        assert!(env.spawned().is_empty());
    }

    #[tokio::test]
    async fn prepare_mounts_then_installs_and_streams_output() {
        let env = Arc::new(FakeEnvironment::new());
        let supervisor = supervisor_with(env.clone(), RunConfig::default());
        let (tx, mut rx) = mpsc::channel(16);

        supervisor
            .prepare("p1", &tree_with_manifest(), &tx)
            .await
            .expect("prepare");

        assert_eq!(env.mount_count(), 1);
        assert_eq!(env.mounts.lock().unwrap()[0].0, "p1");
        assert_eq!(env.spawned(), vec!["p1: npm install".to_string()]);
        assert_eq!(
            rx.recv().await,
            Some(RunEvent::Output {
                chunk: "added 1 package".to_string()
            })
        );
    }

    #[tokio::test]
    async fn prepare_surfaces_install_failure() {
        let mut env = FakeEnvironment::new();
        env.install_exit = 1;
        let supervisor = supervisor_with(Arc::new(env), RunConfig::default());
        let (tx, _rx) = mpsc::channel(16);

        let err = supervisor
            .prepare("p1", &tree_with_manifest(), &tx)
            .await
            .expect_err("install failure");
        assert!(matches!(
            err,
            RuntimeError::InstallFailed { code: Some(1) }
        ));
    }

    #[tokio::test]
    async fn prepare_times_out_and_kills_the_install() {
        let mut env = FakeEnvironment::new();
        env.hang_install = true;
        let env = Arc::new(env);
        let config = RunConfig {
            install_timeout: Duration::from_millis(50),
            ..RunConfig::default()
        };
        let supervisor = supervisor_with(env.clone(), config);
        let (tx, _rx) = mpsc::channel(16);

        let err = supervisor
            .prepare("p1", &tree_with_manifest(), &tx)
            .await
            .expect_err("timeout");
        assert!(matches!(err, RuntimeError::ExecutionTimeout(_)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(env.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_during_install_aborts_the_run() {
        let mut env = FakeEnvironment::new();
        env.hang_install = true;
        let env = Arc::new(env);
        let supervisor = Arc::new(supervisor_with(env.clone(), RunConfig::default()));
        let (tx, _rx) = mpsc::channel(16);

        let runner = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run("p1", &tree_with_manifest(), tx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(supervisor.stop("p1").await);

        let result = runner.await.expect("runner task");
        assert!(matches!(
            result,
            Err(RuntimeError::InstallFailed { code: None })
        ));
        // The run never reached its start command.
        assert_eq!(env.spawned(), vec!["p1: npm install".to_string()]);
        assert_eq!(env.kills.load(Ordering::SeqCst), 1);
        assert!(!supervisor.has_active("p1"));
    }

    #[tokio::test]
    async fn previous_run_survives_the_install_and_is_replaced_at_start() {
        let env = Arc::new(FakeEnvironment::new());
        let supervisor = supervisor_with(env.clone(), RunConfig::default());
        let (tx, _rx) = mpsc::channel(64);

        supervisor.start("p1", tx.clone()).await.expect("first start");
        supervisor
            .run("p1", &tree_with_manifest(), tx)
            .await
            .expect("second run");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The first run is terminated exactly once, at the start phase,
        // and the replacement run is the one left active.
        assert_eq!(env.kills.load(Ordering::SeqCst), 1);
        assert!(supervisor.has_active("p1"));
    }

    #[tokio::test]
    async fn second_start_terminates_the_previous_run() {
        let env = Arc::new(FakeEnvironment::new());
        let supervisor = supervisor_with(env.clone(), RunConfig::default());
        let (tx, mut rx) = mpsc::channel(64);

        supervisor.start("p1", tx.clone()).await.expect("first start");
        assert!(supervisor.has_active("p1"));

        supervisor.start("p1", tx).await.expect("second start");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Exactly one active run afterwards, previous one killed.
        assert_eq!(env.kills.load(Ordering::SeqCst), 1);
        assert!(supervisor.has_active("p1"));

        // Both runs produced output; the first also reported its exit.
        let mut outputs = 0;
        let mut exits = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::Output { .. } => outputs += 1,
                RunEvent::Exited { .. } => exits += 1,
                RunEvent::ServerReady { .. } => {}
            }
        }
        assert_eq!(outputs, 2);
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn stop_kills_and_clears_the_active_run() {
        let env = Arc::new(FakeEnvironment::new());
        let supervisor = supervisor_with(env.clone(), RunConfig::default());
        let (tx, _rx) = mpsc::channel(64);

        supervisor.start("p1", tx).await.expect("start");
        assert!(supervisor.stop("p1").await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(env.kills.load(Ordering::SeqCst), 1);
        assert!(!supervisor.has_active("p1"));
        assert!(!supervisor.stop("p1").await);
    }

    #[tokio::test]
    async fn runs_on_different_rooms_are_independent() {
        let env = Arc::new(FakeEnvironment::new());
        let supervisor = supervisor_with(env.clone(), RunConfig::default());
        let (tx, _rx) = mpsc::channel(64);

        supervisor.start("p1", tx.clone()).await.expect("start p1");
        supervisor.start("p2", tx).await.expect("start p2");

        assert!(supervisor.has_active("p1"));
        assert!(supervisor.has_active("p2"));
        assert_eq!(env.kills.load(Ordering::SeqCst), 0);
    }
}
