//! Request extractors: the end-user session credential for transports and the
//! shared key guarding the internal API.

use std::convert::Infallible;

use axum::extract::{FromRequestParts, Query};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::auth::tokens::secrets_match;
use crate::error::ApiError;
use crate::AppState;

/// Cookie carrying the session credential for browser clients.
pub const SESSION_COOKIE: &str = "session";

/// Header carrying the internal API key.
pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// The raw session credential presented by a client, if any.
///
/// Lookup order: `Authorization: Bearer`, the `session` cookie, `?token=`.
/// Validation happens later in the connection lifecycle so that a rejected
/// WebSocket still gets a proper close frame.
#[derive(Debug, Clone, Default)]
pub struct SessionCredential(pub Option<String>);

impl SessionCredential {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for SessionCredential {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let credential = bearer(&parts.headers)
            .or_else(|| session_cookie(&parts.headers))
            .or_else(|| {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|q| q.0.token)
                    .filter(|t| !t.is_empty())
            });
        Ok(SessionCredential(credential))
    }
}

/// Caller of the internal API. Present only when the `x-internal-key` header
/// matches the configured key, or when no key is configured.
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

impl FromRequestParts<AppState> for InternalCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.internal_api_key.as_deref() else {
            return Ok(InternalCaller);
        };
        let given = parts
            .headers
            .get(INTERNAL_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing internal API key"))?;

        if secrets_match(expected, given) {
            Ok(InternalCaller)
        } else {
            Err(ApiError::unauthorized("Invalid internal API key"))
        }
    }
}
