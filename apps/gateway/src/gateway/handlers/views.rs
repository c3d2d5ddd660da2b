//! `post:view` counters, batched in the shared store and flushed upstream.

use std::sync::Arc;

use roomcast_common::RoomName;

use crate::error::GatewayError;
use crate::gateway::events::PostViewRequest;
use crate::gateway::Gateway;
use crate::services::bounded;

pub async fn record(gw: &Gateway, req: PostViewRequest) -> Result<(), GatewayError> {
    RoomName::post(&req.post_id)
        .map_err(|e| GatewayError::validation(format!("invalid postId: {e}")))?;
    gw.views.incr_view(&req.post_id).await?;
    Ok(())
}

/// Periodically move pending counts to the Persistence Service.
pub async fn run_flusher(gw: Arc<Gateway>) {
    let mut interval = tokio::time::interval(gw.settings.view_flush_interval);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = gw.shutdown_token().cancelled() => break,
            _ = interval.tick() => {
                flush_once(&gw).await;
            }
        }
    }
    // Last flush so counts recorded since the previous tick are not stranded.
    flush_once(&gw).await;
    tracing::debug!("view flusher stopped");
}

/// Drain the counters and hand them upstream. On failure the counts are put
/// back for the next attempt.
pub async fn flush_once(gw: &Gateway) -> usize {
    let pending = match gw.views.drain_views().await {
        Ok(p) if p.is_empty() => return 0,
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "failed to drain view counters");
            return 0;
        }
    };

    match bounded(
        gw.settings.upstream_timeout,
        "flush view counts",
        gw.persistence.flush_view_counts(&pending),
    )
    .await
    {
        Ok(()) => {
            tracing::debug!(posts = pending.len(), "flushed view counters");
            pending.len()
        }
        Err(e) => {
            tracing::warn!(posts = pending.len(), error = %e, "view flush failed, keeping counts");
            if let Err(e) = gw.views.restore_views(&pending).await {
                tracing::error!(posts = pending.len(), error = %e, "lost view counts");
            }
            0
        }
    }
}
