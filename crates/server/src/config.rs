//! Server configuration from CLI flags and environment.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use devsync_runtime::RunConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "devsync", about = "Real-time collaborative project rooms")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4000", env = "DEVSYNC_BIND")]
    pub bind: SocketAddr,

    /// Shared auth token. When set, `/ws` requires
    /// `Authorization: Bearer <token>` or `?token=<token>`.
    #[arg(long, env = "DEVSYNC_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Base URL of the external project store. When unset, rooms start
    /// empty and explicit saves report a persist failure.
    #[arg(long, env = "DEVSYNC_STORE_URL")]
    pub store_url: Option<String>,

    /// Manifest file required before a run can be prepared.
    #[arg(long, default_value = "package.json", env = "DEVSYNC_MANIFEST")]
    pub manifest: String,

    /// Budget for the dependency-install command, in seconds.
    #[arg(long, default_value_t = 300, env = "DEVSYNC_INSTALL_TIMEOUT_SECS")]
    pub install_timeout_secs: u64,

    /// Budget for spawning the start command, in seconds.
    #[arg(long, default_value_t = 30, env = "DEVSYNC_SPAWN_TIMEOUT_SECS")]
    pub spawn_timeout_secs: u64,
}

impl ServerConfig {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            manifest: self.manifest.clone(),
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            spawn_timeout: Duration::from_secs(self.spawn_timeout_secs),
            ..RunConfig::default()
        }
    }
}
