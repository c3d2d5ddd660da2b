//! Identity Service client: resolves a session credential into a principal.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

/// The authenticated identity behind a connection. Fixed for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub banned: bool,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// `Ok(None)` means the credential is unknown or expired.
    async fn validate(&self, credential: &str) -> Result<Option<Principal>, GatewayError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ValidateRequest<'a> {
    credential: &'a str,
}

#[derive(Deserialize)]
struct ValidateResponse {
    principal: Principal,
}

pub struct HttpIdentityService {
    base_url: String,
    http: reqwest::Client,
}

impl HttpIdentityService {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn validate(&self, credential: &str) -> Result<Option<Principal>, GatewayError> {
        let url = format!("{}/internal/sessions/validate", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&ValidateRequest { credential })
            .send()
            .await?;

        match resp.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ValidateResponse = resp.json().await?;
                Ok(Some(body.principal))
            }
            status => {
                tracing::error!(%status, "identity service rejected validation request");
                Err(GatewayError::upstream(format!("identity service returned {status}")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Static implementation (single-node dev / tests)
// ---------------------------------------------------------------------------

/// Credential table held in memory.
#[derive(Default)]
pub struct StaticIdentityService {
    sessions: DashMap<String, Principal>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: &str, principal: Principal) {
        self.sessions.insert(credential.to_string(), principal);
    }

    pub fn revoke(&self, credential: &str) {
        self.sessions.remove(credential);
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn validate(&self, credential: &str) -> Result<Option<Principal>, GatewayError> {
        Ok(self.sessions.get(credential).map(|p| p.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_wire_format_is_camel_case() {
        let p: Principal = serde_json::from_value(serde_json::json!({
            "id": "usr_1",
            "displayName": "Ada",
            "role": "moderator",
        }))
        .unwrap();
        assert_eq!(p.display_name, "Ada");
        assert_eq!(p.role, Role::Moderator);
        assert!(!p.banned);
    }

    #[tokio::test]
    async fn static_service_resolves_and_revokes() {
        let svc = StaticIdentityService::new();
        svc.insert(
            "tok",
            Principal {
                id: "usr_1".into(),
                display_name: "Ada".into(),
                role: Role::User,
                banned: false,
            },
        );
        assert_eq!(svc.validate("tok").await.unwrap().unwrap().id, "usr_1");
        svc.revoke("tok");
        assert!(svc.validate("tok").await.unwrap().is_none());
    }
}
