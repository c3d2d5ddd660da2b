use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomcast_gateway::bus::{BroadcastBus, LocalBus, RedisBus};
use roomcast_gateway::config::Config;
use roomcast_gateway::gateway::{Gateway, GatewayDeps};
use roomcast_gateway::services::identity::HttpIdentityService;
use roomcast_gateway::services::persistence::HttpPersistenceService;
use roomcast_gateway::store::memory::MemoryStore;
use roomcast_gateway::store::redis::RedisStore;
use roomcast_gateway::store::{PresenceStore, ViewCounterStore, WatchPartyStore};
use roomcast_gateway::AppState;

/// How long draining connections get before background tasks are cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let bus_cancel = CancellationToken::new();

    let (deps, mut tasks) = match config.redis_url.as_deref() {
        Some(url) => {
            let store = Arc::new(
                RedisStore::connect(url, &config.redis_prefix)
                    .await
                    .expect("failed to connect to Redis"),
            );
            let (bus, bus_tasks) = RedisBus::start(url, &config.redis_prefix, bus_cancel.clone())
                .await
                .expect("failed to start Redis bus");
            tracing::info!(prefix = %config.redis_prefix, "using Redis presence store and bus");
            let presence: Arc<dyn PresenceStore> = store.clone();
            let parties: Arc<dyn WatchPartyStore> = store.clone();
            let views: Arc<dyn ViewCounterStore> = store;
            let bus: Arc<dyn BroadcastBus> = Arc::new(bus);
            (build_deps(&config, presence, parties, views, bus), bus_tasks)
        }
        None => {
            tracing::warn!("REDIS_URL not set, running as a single instance with in-memory state");
            let store = Arc::new(MemoryStore::new());
            let presence: Arc<dyn PresenceStore> = store.clone();
            let parties: Arc<dyn WatchPartyStore> = store.clone();
            let views: Arc<dyn ViewCounterStore> = store;
            let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new());
            (build_deps(&config, presence, parties, views, bus), Vec::new())
        }
    };

    let gateway = Arc::new(Gateway::new(
        config.instance_id.clone(),
        config.gateway.clone(),
        deps,
    ));
    tasks.extend(gateway.start());

    tracing::info!(
        instance_id = %config.instance_id,
        identity = %config.identity_service_url,
        persistence = %config.persistence_service_url,
        "roomcast-gateway configured"
    );

    let state = AppState {
        gateway: gateway.clone(),
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(roomcast_gateway::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "roomcast-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    let drain = gateway.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            drain.shutdown(SHUTDOWN_GRACE).await;
        })
        .await
        .expect("server error");

    bus_cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("roomcast-gateway stopped");
}

fn build_deps(
    config: &Config,
    presence: Arc<dyn PresenceStore>,
    parties: Arc<dyn WatchPartyStore>,
    views: Arc<dyn ViewCounterStore>,
    bus: Arc<dyn BroadcastBus>,
) -> GatewayDeps {
    GatewayDeps {
        presence,
        parties,
        views,
        bus,
        identity: Arc::new(HttpIdentityService::new(&config.identity_service_url)),
        persistence: Arc::new(HttpPersistenceService::new(&config.persistence_service_url)),
    }
}
