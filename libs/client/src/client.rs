//! Connection driver: one background task owns the socket, reconnects with
//! backoff and replays room joins after every reconnect.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use http::HeaderValue;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use roomcast_common::protocol::{close_code, event};
use roomcast_common::Frame;

use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;
use crate::subscription::{Subscribers, Subscription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port/socket`
    pub url: String,
    /// Session credential, sent as a bearer token.
    pub credential: Option<String>,
    pub policy: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: Some(credential.into()),
            policy: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// The gateway accepted the connection (`connected` received).
    Connected,
    /// Waiting before retry number `attempt`.
    Reconnecting { attempt: u32 },
    /// Terminal.
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug)]
enum Command {
    Emit(Frame),
    Join { room: String, room_type: Option<String> },
    Leave { room: String, room_type: Option<String> },
    Close,
}

/// How a socket session ended.
enum Outcome {
    Retry,
    Stop { code: Option<u16>, reason: String },
}

/// Handle to a self-healing gateway connection.
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    subscribers: Arc<Subscribers>,
    task: JoinHandle<()>,
}

impl GatewayClient {
    /// Start connecting in the background. Use [`wait_connected`] to wait for
    /// the first successful connection.
    ///
    /// [`wait_connected`]: GatewayClient::wait_connected
    pub fn connect(config: ClientConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let subscribers = Arc::new(Subscribers::default());
        let task = tokio::spawn(run(config, commands_rx, state_tx, subscribers.clone()));
        Self {
            commands,
            state,
            subscribers,
            task,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected | ConnectionState::Closed { .. }
                )
            })
            .await
            .map_err(|_| ClientError::Disconnected)?
            .clone();
        match state {
            ConnectionState::Closed { code, reason } => Err(ClientError::Closed { code, reason }),
            _ => Ok(()),
        }
    }

    pub fn subscribe(&self, event: &str) -> Subscription {
        self.subscribers.subscribe(event)
    }

    /// Send an event. Dropped if the connection is down at the time.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), ClientError> {
        self.send(Command::Emit(Frame::new(event, payload)))
    }

    /// Join a room now and after every reconnect.
    pub fn join(&self, room: &str, room_type: Option<&str>) -> Result<(), ClientError> {
        self.send(Command::Join {
            room: room.to_string(),
            room_type: room_type.map(str::to_string),
        })
    }

    pub fn leave(&self, room: &str, room_type: Option<&str>) -> Result<(), ClientError> {
        self.send(Command::Leave {
            room: room.to_string(),
            room_type: room_type.map(str::to_string),
        })
    }

    /// Close the connection and wait for the driver to stop.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Disconnected)
    }
}

async fn run(
    config: ClientConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    subscribers: Arc<Subscribers>,
) {
    let mut rooms: BTreeSet<(String, Option<String>)> = BTreeSet::new();
    let mut attempt: u32 = 0;

    loop {
        let outcome = match open_socket(&config).await {
            Ok(socket) => {
                tracing::debug!(url = %config.url, "gateway socket open");
                drive(socket, &mut commands, &mut rooms, &subscribers, &state, &mut attempt).await
            }
            Err(e) => {
                tracing::debug!(url = %config.url, attempt, error = %e, "gateway connect failed");
                Outcome::Retry
            }
        };

        match outcome {
            Outcome::Stop { code, reason } => {
                tracing::debug!(?code, %reason, "gateway client stopped");
                state.send_replace(ConnectionState::Closed { code, reason });
                return;
            }
            Outcome::Retry => {
                if !config.policy.should_retry(attempt) {
                    tracing::warn!(attempts = attempt, "giving up on gateway connection");
                    state.send_replace(ConnectionState::Closed {
                        code: None,
                        reason: "reconnect attempts exhausted".to_string(),
                    });
                    return;
                }
                let delay = config.policy.delay_for(attempt, &mut rand::thread_rng());
                attempt += 1;
                state.send_replace(ConnectionState::Reconnecting { attempt });
                tracing::debug!(attempt, ?delay, "reconnecting to gateway");
                if !wait_backoff(delay, &mut commands, &mut rooms).await {
                    state.send_replace(ConnectionState::Closed {
                        code: None,
                        reason: "client closed".to_string(),
                    });
                    return;
                }
            }
        }
    }
}

async fn open_socket(config: &ClientConfig) -> Result<Socket, ClientError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
    if let Some(credential) = &config.credential {
        let value = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ClientError::Closed {
            code: None,
            reason: e.to_string(),
        })?;
    Ok(socket)
}

fn join_frame(room: &str, room_type: Option<&str>) -> String {
    let mut payload = json!({ "room": room });
    if let Some(kind) = room_type {
        payload["roomType"] = json!(kind);
    }
    frame_text(event::ROOM_JOIN, payload)
}

fn leave_frame(room: &str, room_type: Option<&str>) -> String {
    let mut payload = json!({ "room": room });
    if let Some(kind) = room_type {
        payload["roomType"] = json!(kind);
    }
    frame_text(event::ROOM_LEAVE, payload)
}

fn frame_text(event: &str, payload: Value) -> String {
    json!({ "event": event, "payload": payload }).to_string()
}

/// Serve one socket until it drops or the client closes.
async fn drive(
    socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    rooms: &mut BTreeSet<(String, Option<String>)>,
    subscribers: &Subscribers,
    state: &watch::Sender<ConnectionState>,
    attempt: &mut u32,
) -> Outcome {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Frames sent before activation are read once the gateway is ready.
    for (room, room_type) in rooms.iter() {
        let text = join_frame(room, room_type.as_deref());
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            return Outcome::Retry;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                let text = match command {
                    None | Some(Command::Close) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client closed".into(),
                            })))
                            .await;
                        return Outcome::Stop {
                            code: Some(1000),
                            reason: "client closed".to_string(),
                        };
                    }
                    Some(Command::Emit(frame)) => frame_text(&frame.event, frame.payload),
                    Some(Command::Join { room, room_type }) => {
                        let text = join_frame(&room, room_type.as_deref());
                        rooms.insert((room, room_type));
                        text
                    }
                    Some(Command::Leave { room, room_type }) => {
                        let text = leave_frame(&room, room_type.as_deref());
                        rooms.remove(&(room, room_type));
                        text
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    return Outcome::Retry;
                }
            }

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: Frame = match serde_json::from_str(text.as_str()) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::debug!(error = %e, "ignoring malformed frame");
                            continue;
                        }
                    };
                    if frame.event == event::CONNECTED {
                        *attempt = 0;
                        state.send_replace(ConnectionState::Connected);
                    }
                    subscribers.dispatch(&frame.event, &frame.payload);
                }
                Some(Ok(Message::Close(close))) => {
                    let (code, reason) = match close {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return match code {
                        Some(code) if !close_code::is_retryable(code) => Outcome::Stop {
                            code: Some(code),
                            reason,
                        },
                        _ => {
                            tracing::debug!(?code, %reason, "gateway closed the connection");
                            Outcome::Retry
                        }
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "gateway socket error");
                    return Outcome::Retry;
                }
                None => return Outcome::Retry,
            },
        }
    }
}

/// Sleep out the backoff while keeping the room set current. Returns `false`
/// if the client was closed meanwhile.
async fn wait_backoff(
    delay: std::time::Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    rooms: &mut BTreeSet<(String, Option<String>)>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                None | Some(Command::Close) => return false,
                Some(Command::Join { room, room_type }) => {
                    rooms.insert((room, room_type));
                }
                Some(Command::Leave { room, room_type }) => {
                    rooms.remove(&(room, room_type));
                }
                Some(Command::Emit(frame)) => {
                    tracing::debug!(event = %frame.event, "dropping event while disconnected");
                }
            },
        }
    }
}
