//! Clients for the services the gateway depends on but does not own.

pub mod identity;
pub mod persistence;

use std::future::Future;
use std::time::Duration;

use crate::error::GatewayError;

/// Run an upstream call under `limit`. Elapsed calls count as upstream failures.
pub async fn bounded<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(call = what, timeout_ms = limit.as_millis() as u64, "upstream call timed out");
            Err(GatewayError::upstream(format!("{what} timed out")))
        }
    }
}
