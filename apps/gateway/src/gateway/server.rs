//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use roomcast_common::protocol::close_code;

use super::handler::{self, close_code_for, close_reason_for, OpenConnection};
use super::handlers;
use super::presence::refresh;
use super::registry::{ConnectionHandle, Transport};
use super::session::Session;
use super::Gateway;
use crate::auth::middleware::SessionCredential;
use crate::error::GatewayError;
use crate::AppState;

/// Normal closure initiated by the client.
const CLOSE_NORMAL: u16 = 1000;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/socket", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    credential: SessionCredential,
) -> impl IntoResponse {
    let gw = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, gw, credential))
}

async fn handle_connection(socket: WebSocket, gw: Arc<Gateway>, credential: SessionCredential) {
    let (mut ws_tx, ws_rx) = socket.split();

    let OpenConnection {
        handle,
        outbound,
        mut session,
    } = match handler::open(&gw, credential.as_deref(), Transport::WebSocket).await {
        Ok(open) => open,
        Err(err) => {
            let _ = send_close(&mut ws_tx, close_code_for(&err), close_reason_for(&err)).await;
            return;
        }
    };

    run_connection(&gw, &handle, &mut session, ws_tx, ws_rx, outbound).await;
    handler::close(&gw, &handle, &mut session).await;
}

/// Main connection loop: write queued frames, read client frames, ping, and
/// enforce the idle timeout.
async fn run_connection(
    gw: &Gateway,
    conn: &ConnectionHandle,
    session: &mut Session,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut outbound: mpsc::Receiver<Arc<str>>,
) {
    let idle_timeout = gw.settings.idle_timeout;
    let mut idle_deadline = Instant::now() + idle_timeout;
    let mut ping = time::interval(gw.settings.ping_interval);
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            // Kicked, asked to reconnect, or the gateway is draining.
            _ = conn.closed() => {
                let reason = conn.close_reason();
                let (code, text) = reason
                    .as_ref()
                    .map(|r| (r.code, r.reason.as_str()))
                    .unwrap_or((close_code::RECONNECT, "reconnect"));
                let _ = send_close(&mut ws_tx, code, text).await;
                break;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                    conn.close(1006, "write failed");
                    break;
                }
            }

            msg = ws_rx.next() => {
                idle_deadline = Instant::now() + idle_timeout;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handlers::handle_text(gw, conn, session, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        if session.record_activity() {
                            refresh(gw, conn).await;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        handler::send_error(
                            conn,
                            &GatewayError::validation("binary frames are not supported"),
                        );
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        conn.close(CLOSE_NORMAL, "client closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %conn.id, "ws read error");
                        conn.close(1006, "read failed");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    conn.close(1006, "write failed");
                    break;
                }
            }

            _ = time::sleep_until(idle_deadline) => {
                tracing::debug!(connection_id = %conn.id, "idle timeout, closing connection");
                conn.close(close_code::IDLE_TIMEOUT, "idle_timeout");
                let _ = send_close(&mut ws_tx, close_code::IDLE_TIMEOUT, "idle_timeout").await;
                break;
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
