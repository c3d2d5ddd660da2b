//! The realtime gateway: connection lifecycle, rooms, fan-out and the
//! per-feature event handlers.

pub mod emit;
pub mod events;
pub mod fanout;
pub mod handler;
pub mod handlers;
pub mod polling;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BroadcastBus, BusMessage};
use crate::config::GatewaySettings;
use crate::ratelimit::RateLimiter;
use crate::services::identity::IdentityService;
use crate::services::persistence::PersistenceService;
use crate::store::{PresenceStore, ViewCounterStore, WatchPartyStore};
use roomcast_common::protocol::close_code;
use roomcast_common::RoomName;

use self::polling::PollSessions;
use self::registry::RoomRegistry;

/// Interval at which idle rate-limit buckets are pruned.
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Collaborators a gateway is built from.
pub struct GatewayDeps {
    pub presence: Arc<dyn PresenceStore>,
    pub parties: Arc<dyn WatchPartyStore>,
    pub views: Arc<dyn ViewCounterStore>,
    pub bus: Arc<dyn BroadcastBus>,
    pub identity: Arc<dyn IdentityService>,
    pub persistence: Arc<dyn PersistenceService>,
}

/// One gateway instance. Constructed once by the process and shared by every
/// connection task and background task it owns.
pub struct Gateway {
    pub instance_id: String,
    pub settings: GatewaySettings,
    pub registry: RoomRegistry,
    pub polls: PollSessions,
    pub presence: Arc<dyn PresenceStore>,
    pub parties: Arc<dyn WatchPartyStore>,
    pub views: Arc<dyn ViewCounterStore>,
    pub bus: Arc<dyn BroadcastBus>,
    pub identity: Arc<dyn IdentityService>,
    pub persistence: Arc<dyn PersistenceService>,
    pub connect_limiter: RateLimiter,
    pub event_limiter: RateLimiter,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(instance_id: String, settings: GatewaySettings, deps: GatewayDeps) -> Self {
        Self {
            instance_id,
            connect_limiter: RateLimiter::new(settings.connect_limit),
            event_limiter: RateLimiter::new(settings.event_limit),
            settings,
            registry: RoomRegistry::new(),
            polls: PollSessions::new(),
            presence: deps.presence,
            parties: deps.parties,
            views: deps.views,
            bus: deps.bus,
            identity: deps.identity,
            persistence: deps.persistence,
            shutdown: CancellationToken::new(),
        }
    }

    /// Parent token of every connection and background task.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Spawn the bus dispatcher and the periodic maintenance tasks.
    ///
    /// The dispatcher subscribes before this returns, so nothing published
    /// afterwards is missed.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let rx = self.bus.subscribe();
        let mut tasks = vec![tokio::spawn(fanout::run_dispatcher(self.clone(), rx))];
        tasks.push(tokio::spawn(presence::run_sweeper(self.clone())));
        tasks.push(tokio::spawn(handlers::views::run_flusher(self.clone())));
        tasks.push(tokio::spawn(polling::run_reaper(self.clone())));
        tasks.push(tokio::spawn(run_limiter_cleanup(self.clone())));
        tracing::info!(instance_id = %self.instance_id, "gateway started");
        tasks
    }

    /// Ask every local client to reconnect elsewhere, wait up to `grace` for
    /// their connections to wind down, then stop all background tasks.
    pub async fn shutdown(&self, grace: Duration) {
        let connections = self.registry.all_connections();
        tracing::info!(connections = connections.len(), "gateway shutting down");
        for conn in &connections {
            conn.close(close_code::RECONNECT, "server shutting down");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.registry.connection_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.shutdown.cancel();
    }

    pub(crate) fn publish_to_room(&self, room: RoomName, event: &str, payload: Value) {
        self.bus
            .publish(BusMessage::room(&self.instance_id, room, event, payload));
    }

    pub(crate) fn publish_to_room_except(
        &self,
        room: RoomName,
        event: &str,
        payload: Value,
        connection_id: &str,
    ) {
        self.bus.publish(
            BusMessage::room(&self.instance_id, room, event, payload).excluding(connection_id),
        );
    }

    pub(crate) fn publish_to_everyone(&self, event: &str, payload: Value) {
        self.bus
            .publish(BusMessage::everyone(&self.instance_id, event, payload));
    }
}

async fn run_limiter_cleanup(gw: Arc<Gateway>) {
    let mut interval = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = gw.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let pruned = gw.connect_limiter.retain_recent() + gw.event_limiter.retain_recent();
                tracing::trace!(pruned, "rate limiter cleanup");
            }
        }
    }
}
