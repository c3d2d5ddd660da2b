use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub instance_id: String,
    /// Connections held by this instance, both transports.
    pub connections: usize,
    pub polling_sessions: usize,
    pub rooms: usize,
    /// Identities online across the cluster; absent if the presence store is
    /// unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<u64>,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Instance is serving", body = HealthResponse),
    ),
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let gw = &state.gateway;
    let online = match gw.presence.online_count().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "health: presence store unavailable");
            None
        }
    };
    Json(HealthResponse {
        status: if online.is_some() { "ok" } else { "degraded" }.to_string(),
        instance_id: gw.instance_id.clone(),
        connections: gw.registry.connection_count(),
        polling_sessions: gw.polls.len(),
        rooms: gw.registry.room_count(),
        online,
    })
}
