//! WebSocket gateway.
//!
//! One socket per member, bound to a single room at upgrade time via
//! query parameters. The socket task owns the connection; everything the
//! member should see arrives on an outbound channel drained by a send
//! task, and everything the member says is parsed and dispatched to the
//! room actor or the run supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use devsync_protocol::{codes, ClientMessage, Member, ServerMessage};
use devsync_runtime::{RunEvent, RunSupervisor, RuntimeError};

use crate::room_actor::RoomActorHandle;
use crate::room_command::RoomCommand;
use crate::state::{JoinError, RoomRegistry};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<RoomRegistry>,
    pub supervisor: Arc<RunSupervisor>,
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    /// Room (project) identifier.
    pub room: String,
    /// Member identifier.
    pub member: String,
    /// Display name; defaults to the member id.
    pub name: Option<String>,
}

/// Messages queued for delivery down the socket.
enum OutboundMessage {
    Message(ServerMessage),
    Pong(Bytes),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<JoinParams>,
    State(state): State<GatewayState>,
) -> Response {
    if devsync_protocol::is_reserved_member_id(&params.member) {
        return (
            StatusCode::UNAUTHORIZED,
            format!("member id {:?} is reserved", params.member),
        )
            .into_response();
    }
    let member = Member::human(
        params.member.clone(),
        params.name.clone().unwrap_or_else(|| params.member.clone()),
    );

    let handle = match state.registry.ensure_room(&params.room).await {
        Ok(handle) => handle,
        Err(err @ JoinError::RoomUnavailable(_)) => {
            return (StatusCode::NOT_FOUND, err.to_string()).into_response();
        }
        Err(err @ JoinError::Unauthorized(_)) => {
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };

    let room_id = params.room;
    ws.on_upgrade(move |socket| handle_socket(socket, state, handle, room_id, member))
}

async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    handle: RoomActorHandle,
    room_id: String,
    member: Member,
) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    if state
        .registry
        .register(conn_id, &room_id, member.clone())
        .is_err()
    {
        // Reserved ids are rejected before the upgrade; nothing else can
        // fail registration.
        return;
    }
    info!(
        component = "gateway",
        event = "gateway.connected",
        room_id = %room_id,
        member_id = %member.id,
        conn_id,
        "Member connected"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(256);
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let frame = match outbound {
                OutboundMessage::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => Message::Text(text.into()),
                    Err(err) => {
                        warn!(
                            component = "gateway",
                            event = "gateway.encode.failed",
                            error = %err,
                            "Failed to encode outbound message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => Message::Pong(data),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Bridge from the room actor's fan-out into this socket's queue.
    let (room_tx, mut room_rx) = mpsc::channel::<ServerMessage>(256);
    let bridge_tx = out_tx.clone();
    let bridge_task = tokio::spawn(async move {
        while let Some(msg) = room_rx.recv().await {
            if bridge_tx.send(OutboundMessage::Message(msg)).await.is_err() {
                break;
            }
        }
    });

    handle
        .send(RoomCommand::Subscribe {
            conn_id,
            member: member.clone(),
            tx: room_tx,
        })
        .await;

    // Join-time state: who is here, and the current tree.
    let _ = out_tx
        .send(OutboundMessage::Message(ServerMessage::Members {
            members: state.registry.members_of(&room_id),
        }))
        .await;
    let _ = out_tx
        .send(OutboundMessage::Message(ServerMessage::Snapshot {
            file_tree: handle.snapshot().as_ref().clone(),
        }))
        .await;

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let envelope = envelope_or_opaque(text.as_str(), &member.id);
                dispatch(&state, &handle, &room_id, conn_id, &out_tx, envelope).await;
            }
            Message::Ping(data) => {
                let _ = out_tx.send(OutboundMessage::Pong(data)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    handle.send(RoomCommand::Unsubscribe { conn_id }).await;
    state.registry.unregister(conn_id);
    bridge_task.abort();
    send_task.abort();
    info!(
        component = "gateway",
        event = "gateway.disconnected",
        room_id = %room_id,
        member_id = %member.id,
        conn_id,
        "Member disconnected"
    );
}

/// Decode an inbound frame. Undecodable frames become opaque chat from
/// the connected member rather than an error; bad input from one member
/// must never take the room down.
fn envelope_or_opaque(text: &str, member_id: &str) -> ClientMessage {
    serde_json::from_str(text).unwrap_or_else(|_| ClientMessage::Chat {
        sender: member_id.to_string(),
        body: Value::String(text.to_string()),
    })
}

async fn dispatch(
    state: &GatewayState,
    handle: &RoomActorHandle,
    room_id: &str,
    conn_id: u64,
    out_tx: &mpsc::Sender<OutboundMessage>,
    envelope: ClientMessage,
) {
    match envelope {
        ClientMessage::Chat { sender, body } => {
            handle
                .send(RoomCommand::Chat {
                    conn_id,
                    sender,
                    body,
                })
                .await;
        }
        ClientMessage::FetchSnapshot => {
            let _ = out_tx
                .send(OutboundMessage::Message(ServerMessage::Snapshot {
                    file_tree: handle.snapshot().as_ref().clone(),
                }))
                .await;
        }
        ClientMessage::SaveFileTree => {
            let handle = handle.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let (reply_tx, reply_rx) = oneshot::channel();
                handle.send(RoomCommand::Save { reply: reply_tx }).await;
                let msg = match reply_rx.await {
                    Ok(Ok(())) => ServerMessage::Saved,
                    Ok(Err(err)) => ServerMessage::error(codes::PERSIST_FAILURE, err),
                    Err(_) => ServerMessage::error(
                        codes::PERSIST_FAILURE,
                        "save was dropped before completion",
                    ),
                };
                let _ = out_tx.send(OutboundMessage::Message(msg)).await;
            });
        }
        ClientMessage::Run => {
            debug!(
                component = "gateway",
                event = "gateway.run.requested",
                room_id = %room_id,
                conn_id,
            );
            spawn_run(state.supervisor.clone(), handle.clone(), room_id.to_string());
        }
        ClientMessage::StopRun => {
            if !state.supervisor.stop(room_id).await {
                debug!(
                    component = "gateway",
                    event = "gateway.stop.noop",
                    room_id = %room_id,
                    "Stop requested with no active run"
                );
            }
        }
    }
}

/// Drive a full run (prepare then start) off the socket task, streaming
/// output into the room as it happens.
fn spawn_run(
    supervisor: Arc<RunSupervisor>,
    handle: RoomActorHandle,
    room_id: String,
) {
    tokio::spawn(async move {
        let tree = handle.snapshot();
        let (event_tx, mut event_rx) = mpsc::channel::<RunEvent>(256);

        let forward_handle = handle.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                forward_handle
                    .send(RoomCommand::Broadcast {
                        msg: run_event_message(event),
                    })
                    .await;
            }
        });

        if let Err(err) = supervisor.run(&room_id, &tree, event_tx).await {
            warn!(
                component = "gateway",
                event = "gateway.run.failed",
                room_id = %room_id,
                error = %err,
                "Run failed"
            );
            handle
                .send(RoomCommand::Broadcast {
                    msg: ServerMessage::error(run_error_code(&err), err.to_string()),
                })
                .await;
        }
        let _ = forwarder.await;
    });
}

/// Output lines travel as assistant-authored chat so they land in the
/// same place as the conversation; readiness and exit are distinguished.
fn run_event_message(event: RunEvent) -> ServerMessage {
    match event {
        RunEvent::Output { chunk } => ServerMessage::system_chat(chunk),
        RunEvent::ServerReady { port, url } => ServerMessage::RunReady { port, url },
        RunEvent::Exited { code } => ServerMessage::RunExited { code },
    }
}

fn run_error_code(err: &RuntimeError) -> &'static str {
    match err {
        RuntimeError::MissingManifest(_) => codes::MISSING_MANIFEST,
        RuntimeError::ExecutionTimeout(_) => codes::EXECUTION_TIMEOUT,
        _ => codes::EXECUTION_FAILURE,
    }
}
