//! Internal API: lets the request/response services push events into the
//! gateway. Guarded by the shared internal key.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use roomcast_common::RoomName;

use crate::auth::middleware::InternalCaller;
use crate::bus::DisconnectReason;
use crate::error::{ApiError, ApiErrorBody};
use crate::store::WatchPartyState;
use crate::AppState;

/// Longest accepted event name.
const MAX_EVENT_LEN: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/internal/emit/users/{user_id}", post(emit_to_user))
        .route("/internal/emit/rooms/{room}", post(emit_to_room))
        .route("/internal/broadcast", post(broadcast))
        .route("/internal/users/{user_id}/disconnect", post(disconnect_user))
        .route("/internal/watch-parties", post(open_watch_party))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EmitRequest {
    pub event: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
}

impl EmitRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.event.is_empty() || self.event.len() > MAX_EVENT_LEN {
            return Err(ApiError::bad_request(format!(
                "event must be between 1 and {MAX_EVENT_LEN} characters"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// POST /internal/emit/users/:user_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/internal/emit/users/{user_id}",
    tag = "Internal",
    security(("internal_key" = [])),
    params(("user_id" = String, Path, description = "Recipient user ID")),
    request_body = EmitRequest,
    responses(
        (status = 202, description = "Event published"),
        (status = 400, description = "Invalid event or user ID", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid internal key", body = ApiErrorBody),
    ),
)]
pub async fn emit_to_user(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<EmitRequest>,
) -> Result<StatusCode, ApiError> {
    body.validate()?;
    state
        .gateway
        .emit_to_user(&user_id, &body.event, body.payload)?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// POST /internal/emit/rooms/:room
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/internal/emit/rooms/{room}",
    tag = "Internal",
    security(("internal_key" = [])),
    params(("room" = String, Path, description = "Room name, e.g. `post:42`")),
    request_body = EmitRequest,
    responses(
        (status = 202, description = "Event published"),
        (status = 400, description = "Invalid event or room name", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid internal key", body = ApiErrorBody),
    ),
)]
pub async fn emit_to_room(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<EmitRequest>,
) -> Result<StatusCode, ApiError> {
    body.validate()?;
    let room: RoomName = room
        .parse()
        .map_err(|e| ApiError::bad_request(format!("Invalid room name: {e}")))?;
    state.gateway.emit_to_room(room, &body.event, body.payload);
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// POST /internal/broadcast
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/internal/broadcast",
    tag = "Internal",
    security(("internal_key" = [])),
    request_body = EmitRequest,
    responses(
        (status = 202, description = "Event published to every connection"),
        (status = 400, description = "Invalid event", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid internal key", body = ApiErrorBody),
    ),
)]
pub async fn broadcast(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Json(body): Json<EmitRequest>,
) -> Result<StatusCode, ApiError> {
    body.validate()?;
    state.gateway.broadcast(&body.event, body.payload);
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// POST /internal/users/:user_id/disconnect
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct DisconnectRequest {
    #[serde(default = "default_disconnect_reason")]
    pub reason: DisconnectReason,
}

fn default_disconnect_reason() -> DisconnectReason {
    DisconnectReason::Kick
}

#[utoipa::path(
    post,
    path = "/internal/users/{user_id}/disconnect",
    tag = "Internal",
    security(("internal_key" = [])),
    params(("user_id" = String, Path, description = "User whose connections are closed")),
    request_body = DisconnectRequest,
    responses(
        (status = 202, description = "Disconnect published"),
        (status = 401, description = "Missing or invalid internal key", body = ApiErrorBody),
    ),
)]
pub async fn disconnect_user(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<DisconnectRequest>,
) -> StatusCode {
    state.gateway.disconnect_user(&user_id, body.reason);
    StatusCode::ACCEPTED
}

// ---------------------------------------------------------------------------
// POST /internal/watch-parties
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenWatchPartyRequest {
    pub party_id: String,
    pub host_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenWatchPartyResponse {
    pub created: bool,
    pub party: WatchPartyState,
}

#[utoipa::path(
    post,
    path = "/internal/watch-parties",
    tag = "Internal",
    security(("internal_key" = [])),
    request_body = OpenWatchPartyRequest,
    responses(
        (status = 201, description = "Watch party created", body = OpenWatchPartyResponse),
        (status = 200, description = "Watch party already existed", body = OpenWatchPartyResponse),
        (status = 400, description = "Invalid party or host ID", body = ApiErrorBody),
        (status = 401, description = "Missing or invalid internal key", body = ApiErrorBody),
    ),
)]
pub async fn open_watch_party(
    _caller: InternalCaller,
    State(state): State<AppState>,
    Json(body): Json<OpenWatchPartyRequest>,
) -> Result<(StatusCode, Json<OpenWatchPartyResponse>), ApiError> {
    let (party, created) = state
        .gateway
        .open_watch_party(&body.party_id, &body.host_id)
        .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(OpenWatchPartyResponse { created, party })))
}
