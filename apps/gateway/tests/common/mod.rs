#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use roomcast_common::Frame;
use roomcast_gateway::bus::{BroadcastBus, LocalBus};
use roomcast_gateway::config::{Config, GatewaySettings};
use roomcast_gateway::gateway::{Gateway, GatewayDeps};
use roomcast_gateway::services::identity::{Principal, Role, StaticIdentityService};
use roomcast_gateway::services::persistence::MemoryPersistence;
use roomcast_gateway::store::memory::MemoryStore;
use roomcast_gateway::AppState;

pub const INTERNAL_KEY: &str = "test-internal-key";

/// How long a test waits for an expected frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_settings() -> GatewaySettings {
    GatewaySettings {
        upstream_timeout: Duration::from_secs(2),
        poll_timeout: Duration::from_millis(500),
        ..GatewaySettings::default()
    }
}

pub fn credential_for(user_id: &str) -> String {
    format!("cred-{user_id}")
}

/// Shared backends standing in for Redis and the upstream services. Every
/// instance spawned from the same cluster sees the same state and bus.
#[derive(Clone)]
pub struct TestCluster {
    pub store: Arc<MemoryStore>,
    pub bus: LocalBus,
    pub identity: Arc<StaticIdentityService>,
    pub persistence: Arc<MemoryPersistence>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            bus: LocalBus::new(),
            identity: Arc::new(StaticIdentityService::new()),
            persistence: Arc::new(MemoryPersistence::new()),
        }
    }

    /// Register a user and return their credential.
    pub fn add_user(&self, user_id: &str) -> String {
        self.add_principal(user_id, false)
    }

    pub fn add_banned_user(&self, user_id: &str) -> String {
        self.add_principal(user_id, true)
    }

    fn add_principal(&self, user_id: &str, banned: bool) -> String {
        let credential = credential_for(user_id);
        self.identity.insert(
            &credential,
            Principal {
                id: user_id.to_string(),
                display_name: format!("{user_id} name"),
                role: Role::User,
                banned,
            },
        );
        credential
    }

    pub async fn spawn(&self, instance_id: &str, settings: GatewaySettings) -> TestServer {
        let bus: Arc<dyn BroadcastBus> = Arc::new(self.bus.clone());
        let deps = GatewayDeps {
            presence: self.store.clone(),
            parties: self.store.clone(),
            views: self.store.clone(),
            bus,
            identity: self.identity.clone(),
            persistence: self.persistence.clone(),
        };
        let gateway = Arc::new(Gateway::new(instance_id.to_string(), settings.clone(), deps));
        gateway.start();

        let state = AppState {
            gateway: gateway.clone(),
            config: Arc::new(test_config(instance_id, settings)),
        };
        let app = roomcast_gateway::routes::router().with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            addr,
            gateway,
            state,
        }
    }
}

pub fn test_config(instance_id: &str, settings: GatewaySettings) -> Config {
    Config {
        port: 0,
        instance_id: instance_id.to_string(),
        redis_url: None,
        redis_prefix: "roomcast-test".to_string(),
        identity_service_url: "http://identity.invalid".to_string(),
        persistence_service_url: "http://persistence.invalid".to_string(),
        internal_api_key: Some(INTERNAL_KEY.to_string()),
        gateway: settings,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway>,
    pub state: AppState,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/socket", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Connect as `user_id` (already registered) and wait for `connected`.
    pub async fn connect(&self, user_id: &str) -> (WsClient, Value) {
        let mut client = WsClient::open(&self.ws_url(), Some(&credential_for(user_id))).await;
        let connected = client.expect("connected").await;
        (client, connected)
    }
}

/// Single-instance setup: one cluster, one server.
pub async fn start_server() -> (TestServer, TestCluster) {
    start_server_with(test_settings()).await
}

pub async fn start_server_with(settings: GatewaySettings) -> (TestServer, TestCluster) {
    let cluster = TestCluster::new();
    let server = cluster.spawn("gwi_test", settings).await;
    (server, cluster)
}

/// Poll `check` until it holds or the frame timeout passes.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = time::Instant::now() + FRAME_TIMEOUT;
    while time::Instant::now() < deadline {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn open(url: &str, credential: Option<&str>) -> Self {
        let mut request = url.into_client_request().expect("request");
        if let Some(credential) = credential {
            request.headers_mut().insert(
                "authorization",
                format!("Bearer {credential}").parse().unwrap(),
            );
        }
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("ws connect");
        Self { stream }
    }

    pub async fn send(&mut self, event: &str, payload: Value) {
        let frame = Frame::new(event, payload);
        self.stream
            .send(Message::Text(serde_json::to_string(&frame).unwrap().into()))
            .await
            .expect("ws send");
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("ws send");
    }

    async fn next_message(&mut self, within: Duration) -> Option<Message> {
        match time::timeout(within, self.stream.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            Ok(Some(Err(tungstenite::Error::ConnectionClosed))) | Ok(None) => None,
            Ok(Some(Err(e))) => panic!("ws read error: {e}"),
            Err(_) => None,
        }
    }

    /// Next frame of any kind, skipping control messages.
    pub async fn next_frame(&mut self, within: Duration) -> Option<Frame> {
        let deadline = time::Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match self.next_message(remaining).await? {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).expect("frame json"))
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Skip frames until one named `event` arrives and return its payload.
    pub async fn expect(&mut self, event: &str) -> Value {
        let deadline = time::Instant::now() + FRAME_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match self.next_frame(remaining).await {
                Some(frame) if frame.event == event => return frame.payload,
                Some(_) => continue,
                None => panic!("expected `{event}` but none arrived"),
            }
        }
    }

    /// Assert that no frame named `event` arrives within `within`.
    pub async fn expect_none(&mut self, event: &str, within: Duration) {
        let deadline = time::Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.next_frame(remaining).await {
                Some(frame) if frame.event == event => {
                    panic!("unexpected `{event}`: {}", frame.payload)
                }
                Some(_) => continue,
                None => return,
            }
        }
    }

    /// Wait for the server's close frame and return its code and reason.
    pub async fn expect_close(&mut self) -> (u16, String) {
        let deadline = time::Instant::now() + FRAME_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            match self.next_message(remaining).await {
                Some(Message::Close(Some(frame))) => {
                    return (u16::from(frame.code), frame.reason.to_string())
                }
                Some(Message::Close(None)) => panic!("close frame without a code"),
                Some(_) => continue,
                None => panic!("connection ended without a close frame"),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
        // Drain until the server acknowledges.
        while let Ok(Some(Ok(_))) = time::timeout(Duration::from_secs(2), self.stream.next()).await {}
    }
}
