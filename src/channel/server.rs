//! HTTP and WebSocket surface of the coordination server.
//!
//! One axum router serves the health probe, the session REST endpoints,
//! and the two progress-channel shapes: session-keyed (multi-stage "full
//! generation") and request-id-keyed (single-stage generation). Both carry
//! the same [`ProgressMessage`] JSON frames.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    is_system_message, CLOSE_IDLE_TIMEOUT, CLOSE_NORMAL, CLOSE_SUPERSEDED, PONG_TEXT,
};
use crate::config::GlobalConfig;
use crate::invocation::Operation;
use crate::models::progress::ProgressMessage;
use crate::models::session::Session;
use crate::registry::{ChannelAttachment, SessionRegistry};
use crate::supervisor::{Supervisor, WorkerLock};
use crate::{AppError, Result};

/// Shared state behind every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Parsed global configuration.
    pub config: Arc<GlobalConfig>,
    /// Owner of all session lifecycle.
    pub registry: Arc<SessionRegistry>,
    /// Worker process supervisor.
    pub supervisor: Arc<Supervisor>,
}

/// Body of `POST /api/sessions`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Caller-supplied session identifier.
    pub session_id: String,
    /// Opaque metadata staged for the run (parsed document title, fields).
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
    /// Repository the run operates on.
    #[serde(default)]
    pub repo_path: Option<String>,
}

/// Body of `POST /api/sessions/{id}/launch`.
#[derive(Debug, Deserialize)]
pub struct LaunchRequest {
    /// Workflow to run (`full-generate` or `single-generate`).
    pub operation: String,
    /// Operation-specific invocation parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// JSON error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Channel role selected by the `role` query parameter.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ChannelRole {
    /// The at-most-one UI consumer; attaching supersedes the previous one.
    #[default]
    Subscriber,
    /// A worker pushing stage transitions into the registry.
    Publisher,
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    #[serde(default)]
    role: ChannelRole,
}

/// Build the application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/launch", post(launch_worker))
        .route("/ws/sessions/{id}/progress", get(ws_session))
        .route("/ws/generate/{request_id}", get(ws_generate))
        .with_state(state)
}

/// Serve the router until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listen address cannot be bound.
pub async fn serve(state: AppState, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.http_port));
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    serve_with_listener(listener, state, ct).await
}

/// Serve the router on an already-bound listener (used by tests for
/// ephemeral ports).
///
/// # Errors
///
/// Returns `AppError::Io` if the accept loop fails.
pub async fn serve_with_listener(
    listener: TcpListener,
    state: AppState,
    ct: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().map_err(AppError::from)?;
    info!(%addr, "progress channel server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(err.to_string()))
}

/// Handler for `GET /health` — returns 200 OK with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    match state
        .registry
        .create(&body.session_id, body.metadata, body.repo_path)
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.snapshot(&id).await {
        Some(session) => Json::<Session>(session).into_response(),
        None => error_response(&AppError::NotFound(format!("session {id} not found"))),
    }
}

async fn launch_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LaunchRequest>,
) -> Response {
    if state.registry.snapshot(&id).await.is_none() {
        return error_response(&AppError::NotFound(format!("session {id} not found")));
    }

    let operation = match Operation::parse(&body.operation) {
        Ok(op) => op,
        Err(err) => return error_response(&err),
    };

    match state.supervisor.launch(&id, operation, body.params).await {
        Ok(lock) => Json::<WorkerLock>(lock).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn ws_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.registry.snapshot(&id).await.is_none() {
        return error_response(&AppError::NotFound(format!("session {id} not found")));
    }
    upgrade_channel(state, id, query.role, ws)
}

/// Single-stage variant: the first attach stages an ephemeral session
/// under the request id.
async fn ws_generate(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = state.registry.ensure(&request_id).await {
        return error_response(&err);
    }
    upgrade_channel(state, request_id, query.role, ws)
}

fn upgrade_channel(
    state: AppState,
    session_id: String,
    role: ChannelRole,
    ws: WebSocketUpgrade,
) -> Response {
    match role {
        ChannelRole::Subscriber => {
            ws.on_upgrade(move |socket| subscriber_loop(socket, state, session_id))
        }
        ChannelRole::Publisher => {
            ws.on_upgrade(move |socket| publisher_loop(socket, state, session_id))
        }
    }
}

/// Drive one subscriber connection: forward published messages, echo the
/// client's keepalive pings, close on idle, supersession, or a terminal
/// message.
async fn subscriber_loop(socket: WebSocket, state: AppState, session_id: String) {
    let attachment = match state.registry.attach_channel(&session_id).await {
        Ok(attachment) => attachment,
        Err(err) => {
            warn!(%err, session_id, "subscriber attach failed");
            return;
        }
    };
    let ChannelAttachment {
        mut rx,
        superseded,
        seq,
    } = attachment;

    let (mut sink, mut stream) = socket.split();
    let idle_deadline = state.config.timeouts.idle_deadline();
    let idle_interval = Duration::from_secs(state.config.timeouts.idle_interval_seconds);
    let mut keepalive = tokio::time::interval(idle_interval);
    keepalive.tick().await;
    let mut last_seen = tokio::time::Instant::now();

    info!(session_id, seq, "subscriber channel open");

    loop {
        tokio::select! {
            forwarded = rx.recv() => {
                let Some(message) = forwarded else { break };
                let terminal = message.status.is_terminal();
                if send_json(&mut sink, &message).await.is_err() {
                    break;
                }
                if terminal {
                    debug!(session_id, "terminal message delivered; closing normally");
                    let _ = close_with(&mut sink, CLOSE_NORMAL, "complete").await;
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = tokio::time::Instant::now();
                        if let Ok(message) = serde_json::from_str::<ProgressMessage>(&text) {
                            if is_system_message(&message) {
                                let pong = ProgressMessage::keepalive(&session_id, PONG_TEXT);
                                if send_json(&mut sink, &pong).await.is_err() {
                                    break;
                                }
                            }
                            // Subscribers do not publish; anything else is dropped.
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, session_id, "subscriber socket error");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                if last_seen.elapsed() > idle_deadline {
                    warn!(session_id, "idle deadline passed; closing channel");
                    let _ = close_with(&mut sink, CLOSE_IDLE_TIMEOUT, "idle timeout").await;
                    break;
                }
                let beat = ProgressMessage::keepalive(&session_id, "keepalive");
                if send_json(&mut sink, &beat).await.is_err() {
                    break;
                }
            }
            () = superseded.cancelled() => {
                info!(session_id, seq, "channel superseded by newer connection");
                let _ = close_with(&mut sink, CLOSE_SUPERSEDED, "superseded").await;
                break;
            }
        }
    }

    state.registry.detach_channel(&session_id, seq).await;
    info!(session_id, seq, "subscriber channel closed");
}

/// Drive one publisher connection: route inbound frames into the
/// registry, echo keepalives, close normally once a terminal message has
/// been published.
async fn publisher_loop(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sink, mut stream) = socket.split();
    let idle_deadline = state.config.timeouts.idle_deadline();
    let mut idle = tokio::time::interval(idle_deadline);
    idle.tick().await;
    let mut last_seen = tokio::time::Instant::now();

    info!(session_id, "publisher channel open");

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = tokio::time::Instant::now();
                        let message = match serde_json::from_str::<ProgressMessage>(&text) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(%err, session_id, "unparseable publisher frame");
                                continue;
                            }
                        };
                        if is_system_message(&message) {
                            let pong = ProgressMessage::keepalive(&session_id, PONG_TEXT);
                            if send_json(&mut sink, &pong).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let terminal = message.status.is_terminal();
                        if let Err(err) = state.registry.publish(&session_id, message).await {
                            warn!(%err, session_id, "publish rejected");
                            continue;
                        }
                        if terminal {
                            let _ = close_with(&mut sink, CLOSE_NORMAL, "terminal published").await;
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, session_id, "publisher socket error");
                        break;
                    }
                }
            }
            _ = idle.tick() => {
                if last_seen.elapsed() > idle_deadline {
                    warn!(session_id, "silent publisher; closing channel");
                    let _ = close_with(&mut sink, CLOSE_IDLE_TIMEOUT, "idle timeout").await;
                    break;
                }
            }
        }
    }

    info!(session_id, "publisher channel closed");
}

async fn send_json(
    sink: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    message: &ProgressMessage,
) -> std::result::Result<(), axum::Error> {
    let json = serde_json::to_string(message)
        .map_err(|err| axum::Error::new(std::io::Error::other(err)))?;
    sink.send(Message::Text(json.into())).await
}

async fn close_with(
    sink: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    code: u16,
    reason: &'static str,
) -> std::result::Result<(), axum::Error> {
    sink.send(Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    })))
    .await
}

/// Map an [`AppError`] onto an HTTP status and JSON error body.
fn error_response(err: &AppError) -> Response {
    let (status, tag) = match err {
        AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        AppError::DuplicateSession(_) => (StatusCode::CONFLICT, "duplicate_session"),
        AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        AppError::Launch(_) => (StatusCode::BAD_GATEWAY, "launch"),
        AppError::Pipeline { .. } => (StatusCode::BAD_GATEWAY, "pipeline"),
        AppError::Connectivity(_) => (StatusCode::GATEWAY_TIMEOUT, "connectivity"),
        AppError::Config(_) | AppError::Channel(_) | AppError::Io(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    (
        status,
        Json(ErrorBody {
            error: tag.into(),
            message: err.to_string(),
        }),
    )
        .into_response()
}
