pub mod health;
pub mod internal;

use axum::Router;
use utoipa::openapi::security::{ApiKey, ApiKeyValue, Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::auth::middleware::INTERNAL_KEY_HEADER;
use crate::gateway::{polling, server};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(server::router())
        .merge(polling::router())
        .merge(internal::router())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
            components.add_security_scheme(
                "internal_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(INTERNAL_KEY_HEADER))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Polling transport
        polling::open_session,
        polling::poll_frames,
        polling::send_frames,
        polling::close_session,
        // Internal
        internal::emit_to_user,
        internal::emit_to_room,
        internal::broadcast,
        internal::disconnect_user,
        internal::open_watch_party,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            // Shared models
            crate::services::identity::Principal,
            crate::services::identity::Role,
            crate::services::persistence::ChatMessage,
            crate::store::WatchPartyState,
            crate::bus::DisconnectReason,
            // Route request/response types
            health::HealthResponse,
            polling::PollOpened,
            polling::PollClosed,
            internal::EmitRequest,
            internal::DisconnectRequest,
            internal::OpenWatchPartyRequest,
            internal::OpenWatchPartyResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Transport", description = "Long-polling fallback transport"),
        (name = "Internal", description = "Event injection for backend services"),
    )
)]
pub struct ApiDoc;
