//! Long-polling fallback transport.
//!
//! A polling session is an ordinary connection whose outbound queue is drained
//! by `GET` requests instead of a socket writer. It runs through the same
//! lifecycle as a WebSocket connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use utoipa::ToSchema;

use roomcast_common::protocol::close_code;

use super::handler::{self, OpenConnection};
use super::handlers;
use super::presence::refresh;
use super::registry::{ConnectionHandle, Transport};
use super::session::Session;
use super::Gateway;
use crate::auth::middleware::SessionCredential;
use crate::auth::tokens::generate_poll_sid;
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

/// Upper bound on frames returned by a single poll.
const MAX_FRAMES_PER_POLL: usize = 128;

/// Upper bound on frames accepted by a single send.
const MAX_FRAMES_PER_SEND: usize = 32;

pub struct PollSession {
    handle: ConnectionHandle,
    outbound: AsyncMutex<mpsc::Receiver<Arc<str>>>,
    session: AsyncMutex<Session>,
    last_seen: Mutex<Instant>,
}

impl PollSession {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Live polling sessions on this instance, keyed by their opaque sid.
#[derive(Default)]
pub struct PollSessions {
    sessions: DashMap<String, Arc<PollSession>>,
}

impl PollSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, open: OpenConnection) -> String {
        let sid = generate_poll_sid();
        self.sessions.insert(
            sid.clone(),
            Arc::new(PollSession {
                handle: open.handle,
                outbound: AsyncMutex::new(open.outbound),
                session: AsyncMutex::new(open.session),
                last_seen: Mutex::new(Instant::now()),
            }),
        );
        sid
    }

    fn get(&self, sid: &str) -> Option<Arc<PollSession>> {
        self.sessions.get(sid).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Remove the session and run the close half of the lifecycle. Only the
/// caller that actually removes it does the work.
async fn finalize(gw: &Gateway, sid: &str) {
    let Some((_, poll)) = gw.polls.sessions.remove(sid) else {
        return;
    };
    let mut session = poll.session.lock().await;
    handler::close(gw, &poll.handle, &mut session).await;
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/socket/poll", post(open_session))
        .route(
            "/socket/poll/{sid}",
            post(send_frames).get(poll_frames).delete(close_session),
        )
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollOpened {
    pub sid: String,
    pub connection_id: String,
}

/// Body of a `410 Gone`: the close frame a WebSocket client would have seen.
#[derive(Debug, Serialize, ToSchema)]
pub struct PollClosed {
    pub code: u16,
    pub reason: String,
}

fn gone(handle: &ConnectionHandle) -> Response {
    let (code, reason) = handle
        .close_reason()
        .map(|r| (r.code, r.reason))
        .unwrap_or((close_code::RECONNECT, "closed".to_string()));
    (StatusCode::GONE, Json(PollClosed { code, reason })).into_response()
}

fn unknown_session() -> ApiError {
    ApiError::not_found("Unknown polling session")
}

// ---------------------------------------------------------------------------
// POST /socket/poll
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/socket/poll",
    tag = "Transport",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Polling session opened", body = PollOpened),
        (status = 401, description = "Missing or invalid credential", body = ApiErrorBody),
        (status = 403, description = "Principal is banned", body = ApiErrorBody),
        (status = 429, description = "Too many connection attempts", body = ApiErrorBody),
        (status = 502, description = "Identity Service unavailable", body = ApiErrorBody),
    ),
)]
pub async fn open_session(
    State(state): State<AppState>,
    credential: SessionCredential,
) -> Result<Json<PollOpened>, ApiError> {
    let gw = &state.gateway;
    let open = handler::open(gw, credential.as_deref(), Transport::Polling).await?;
    let connection_id = open.handle.id.clone();
    let sid = gw.polls.insert(open);
    Ok(Json(PollOpened { sid, connection_id }))
}

// ---------------------------------------------------------------------------
// GET /socket/poll/:sid
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/socket/poll/{sid}",
    tag = "Transport",
    params(("sid" = String, Path, description = "Polling session id")),
    responses(
        (status = 200, description = "Queued frames, possibly empty after the hold time"),
        (status = 404, description = "Unknown polling session", body = ApiErrorBody),
        (status = 409, description = "Another poll is already waiting", body = ApiErrorBody),
        (status = 410, description = "Connection was closed", body = PollClosed),
    ),
)]
pub async fn poll_frames(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let poll = gw.polls.get(&sid).ok_or_else(unknown_session)?;
    poll.touch();
    {
        let mut session = poll.session.lock().await;
        if session.record_activity() {
            refresh(gw, &poll.handle).await;
        }
    }

    let mut outbound = poll
        .outbound
        .try_lock()
        .map_err(|_| ApiError::conflict("A poll is already waiting on this session"))?;

    let mut frames = Vec::new();
    while frames.len() < MAX_FRAMES_PER_POLL {
        match outbound.try_recv() {
            Ok(frame) => frames.push(frame),
            Err(_) => break,
        }
    }

    if frames.is_empty() {
        if poll.handle.is_closed() {
            drop(outbound);
            finalize(gw, &sid).await;
            return Ok(gone(&poll.handle));
        }
        tokio::select! {
            frame = outbound.recv() => frames.extend(frame),
            _ = poll.handle.closed() => {}
            _ = tokio::time::sleep(gw.settings.poll_timeout) => {}
        }
        while frames.len() < MAX_FRAMES_PER_POLL {
            match outbound.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        if frames.is_empty() && poll.handle.is_closed() {
            drop(outbound);
            finalize(gw, &sid).await;
            return Ok(gone(&poll.handle));
        }
    }
    drop(outbound);
    poll.touch();

    let body = format!(
        "[{}]",
        frames.iter().map(|f| &**f).collect::<Vec<&str>>().join(",")
    );
    Ok(([(CONTENT_TYPE, "application/json")], body).into_response())
}

// ---------------------------------------------------------------------------
// POST /socket/poll/:sid
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/socket/poll/{sid}",
    tag = "Transport",
    params(("sid" = String, Path, description = "Polling session id")),
    request_body(content = Value, description = "One `{event, payload}` frame or an array of frames"),
    responses(
        (status = 204, description = "Frames accepted"),
        (status = 400, description = "Too many frames", body = ApiErrorBody),
        (status = 404, description = "Unknown polling session", body = ApiErrorBody),
        (status = 410, description = "Connection was closed", body = PollClosed),
    ),
)]
pub async fn send_frames(
    State(state): State<AppState>,
    Path(sid): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let poll = gw.polls.get(&sid).ok_or_else(unknown_session)?;
    if poll.handle.is_closed() {
        return Ok(gone(&poll.handle));
    }
    poll.touch();

    let frames = match body {
        Value::Array(frames) => frames,
        frame => vec![frame],
    };
    if frames.len() > MAX_FRAMES_PER_SEND {
        return Err(ApiError::bad_request(format!(
            "At most {MAX_FRAMES_PER_SEND} frames per request"
        )));
    }

    let mut session = poll.session.lock().await;
    for frame in frames {
        handlers::handle_frame(gw, &poll.handle, &mut session, frame).await;
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---------------------------------------------------------------------------
// DELETE /socket/poll/:sid
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/socket/poll/{sid}",
    tag = "Transport",
    params(("sid" = String, Path, description = "Polling session id")),
    responses(
        (status = 204, description = "Session closed"),
        (status = 404, description = "Unknown polling session", body = ApiErrorBody),
    ),
)]
pub async fn close_session(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<StatusCode, ApiError> {
    let gw = &state.gateway;
    let poll = gw.polls.get(&sid).ok_or_else(unknown_session)?;
    poll.handle.close(1000, "client closed");
    finalize(gw, &sid).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Close polling sessions whose client stopped polling.
pub async fn run_reaper(gw: Arc<Gateway>) {
    let period = (gw.settings.idle_timeout / 3).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = gw.shutdown_token().cancelled() => break,
            _ = interval.tick() => {
                let reaped = reap_idle(&gw).await;
                if reaped > 0 {
                    tracing::debug!(reaped, "reaped idle polling sessions");
                }
            }
        }
    }
}

pub async fn reap_idle(gw: &Gateway) -> usize {
    let idle: Vec<(String, ConnectionHandle)> = gw
        .polls
        .sessions
        .iter()
        .filter(|entry| entry.idle_for() > gw.settings.idle_timeout)
        .map(|entry| (entry.key().clone(), entry.handle.clone()))
        .collect();

    for (sid, handle) in &idle {
        handle.close(close_code::IDLE_TIMEOUT, "idle_timeout");
        finalize(gw, sid).await;
    }
    idle.len()
}
