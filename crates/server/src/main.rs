//! devsync server
//!
//! Real-time collaboration rooms over WebSocket: chat relay, shared
//! file-tree state, and a run bridge that executes the tree and streams
//! its output back into the room.

mod auth;
mod config;
mod logging;
mod persistence;
mod room;
mod room_actor;
mod room_command;
mod state;
mod websocket;

use std::sync::Arc;

use axum::{middleware, response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use devsync_runtime::{LocalEnvironment, RunSupervisor};

use crate::auth::auth_middleware;
use crate::config::ServerConfig;
use crate::persistence::{create_persistence_channel, HttpProjectStore, PersistenceWriter, ProjectStore};
use crate::state::RoomRegistry;
use crate::websocket::{ws_handler, GatewayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    let _logging = logging::init_logging()?;

    info!(
        component = "main",
        event = "server.starting",
        bind = %config.bind,
        "Starting devsync server"
    );

    let store: Option<Arc<dyn ProjectStore>> = config
        .store_url
        .as_deref()
        .map(|url| Arc::new(HttpProjectStore::new(url)) as Arc<dyn ProjectStore>);

    let (persist_tx, persist_rx) = create_persistence_channel();
    tokio::spawn(PersistenceWriter::new(persist_rx, store.clone()).run());

    let registry = Arc::new(RoomRegistry::new(persist_tx, store));
    let environment = Arc::new(LocalEnvironment::new()?);
    let supervisor = Arc::new(RunSupervisor::new(environment, config.run_config()));

    let gateway = GatewayState {
        registry,
        supervisor,
    };

    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(gateway);

    if let Some(token) = config.auth_token.clone() {
        app = app.layer(middleware::from_fn_with_state(token, auth_middleware));
    }

    let app = app.layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        component = "main",
        event = "server.listening",
        bind = %config.bind,
        "Listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
