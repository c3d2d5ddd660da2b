//! Internal emit API and health, driven in-process.

mod common;

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use common::{start_server, INTERNAL_KEY};
use roomcast_common::RoomName;
use roomcast_gateway::gateway::registry::{ConnectionHandle, Transport};
use roomcast_gateway::gateway::Gateway;
use roomcast_gateway::services::identity::{Principal, Role};

fn key_header() -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("x-internal-key"),
        HeaderValue::from_static(INTERNAL_KEY),
    )
}

/// Register a bare connection for `user_id` and return its outbound queue.
fn attach(gw: &Gateway, id: &str, user_id: &str) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
    let principal = Arc::new(Principal {
        id: user_id.to_string(),
        display_name: user_id.to_string(),
        role: Role::User,
        banned: false,
    });
    let (handle, rx) = ConnectionHandle::new(
        id.to_string(),
        principal,
        Transport::WebSocket,
        16,
        gw.shutdown_token(),
    );
    gw.registry.register(handle.clone());
    gw.registry.add(&handle.id, &RoomName::user(user_id).unwrap());
    (handle, rx)
}

async fn next_frame(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("frame in time")
        .expect("channel open");
    serde_json::from_str(&frame).unwrap()
}

#[tokio::test]
async fn internal_routes_require_the_key() {
    let (server, _cluster) = start_server().await;
    let api = TestServer::new(roomcast_gateway::routes::router().with_state(server.state.clone()))
        .unwrap();

    let resp = api
        .post("/internal/broadcast")
        .json(&json!({"event": "maintenance", "payload": {}}))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let resp = api
        .post("/internal/broadcast")
        .add_header(
            HeaderName::from_static("x-internal-key"),
            HeaderValue::from_static("wrong"),
        )
        .json(&json!({"event": "maintenance", "payload": {}}))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn emit_to_user_delivers_to_personal_room() {
    let (server, _cluster) = start_server().await;
    let api = TestServer::new(roomcast_gateway::routes::router().with_state(server.state.clone()))
        .unwrap();
    let (_handle, mut rx) = attach(&server.gateway, "conn_test1", "usr_1");

    let (name, value) = key_header();
    let resp = api
        .post("/internal/emit/users/usr_1")
        .add_header(name, value)
        .json(&json!({"event": "notification:new", "payload": {"id": "n1"}}))
        .await;
    resp.assert_status(StatusCode::ACCEPTED);

    let frame = next_frame(&mut rx).await;
    assert_eq!(frame["event"], "notification:new");
    assert_eq!(frame["payload"]["id"], "n1");
}

#[tokio::test]
async fn emit_to_room_validates_names() {
    let (server, _cluster) = start_server().await;
    let api = TestServer::new(roomcast_gateway::routes::router().with_state(server.state.clone()))
        .unwrap();
    let (handle, mut rx) = attach(&server.gateway, "conn_test2", "usr_2");
    server.gateway.registry.add(&handle.id, &RoomName::post("42").unwrap());

    let (name, value) = key_header();
    api.post("/internal/emit/rooms/post:42")
        .add_header(name, value)
        .json(&json!({"event": "post:updated", "payload": {"title": "new"}}))
        .await
        .assert_status(StatusCode::ACCEPTED);
    let frame = next_frame(&mut rx).await;
    assert_eq!(frame["event"], "post:updated");

    let (name, value) = key_header();
    let resp = api
        .post("/internal/emit/rooms/lobby:1")
        .add_header(name, value)
        .json(&json!({"event": "x", "payload": {}}))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    let (name, value) = key_header();
    api.post("/internal/broadcast")
        .add_header(name, value)
        .json(&json!({"event": "", "payload": {}}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn broadcast_reaches_every_connection() {
    let (server, _cluster) = start_server().await;
    let api = TestServer::new(roomcast_gateway::routes::router().with_state(server.state.clone()))
        .unwrap();
    let (_a, mut rx_a) = attach(&server.gateway, "conn_a", "usr_a");
    let (_b, mut rx_b) = attach(&server.gateway, "conn_b", "usr_b");

    let (name, value) = key_header();
    api.post("/internal/broadcast")
        .add_header(name, value)
        .json(&json!({"event": "maintenance", "payload": {"in": 5}}))
        .await
        .assert_status(StatusCode::ACCEPTED);

    assert_eq!(next_frame(&mut rx_a).await["event"], "maintenance");
    assert_eq!(next_frame(&mut rx_b).await["event"], "maintenance");
}

#[tokio::test]
async fn disconnect_route_closes_connections() {
    let (server, _cluster) = start_server().await;
    let api = TestServer::new(roomcast_gateway::routes::router().with_state(server.state.clone()))
        .unwrap();
    let (handle, _rx) = attach(&server.gateway, "conn_k", "usr_k");

    let (name, value) = key_header();
    api.post("/internal/users/usr_k/disconnect")
        .add_header(name, value)
        .json(&json!({"reason": "reconnect"}))
        .await
        .assert_status(StatusCode::ACCEPTED);

    tokio::time::timeout(Duration::from_secs(5), handle.closed())
        .await
        .expect("closed in time");
    let reason = handle.close_reason().unwrap();
    assert_eq!(reason.code, 4012);
    assert_eq!(reason.reason, "reconnect");
}

#[tokio::test]
async fn watch_party_creation_is_idempotent() {
    let (server, _cluster) = start_server().await;
    let api = TestServer::new(roomcast_gateway::routes::router().with_state(server.state.clone()))
        .unwrap();

    let (name, value) = key_header();
    let resp = api
        .post("/internal/watch-parties")
        .add_header(name, value)
        .json(&json!({"partyId": "p1", "hostId": "usr_host"}))
        .await;
    resp.assert_status(StatusCode::CREATED);
    let body: Value = resp.json();
    assert_eq!(body["created"], true);
    assert_eq!(body["party"]["hostId"], "usr_host");
    assert_eq!(body["party"]["isPlaying"], false);

    let (name, value) = key_header();
    let resp = api
        .post("/internal/watch-parties")
        .add_header(name, value)
        .json(&json!({"partyId": "p1", "hostId": "usr_other"}))
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["created"], false);
    assert_eq!(body["party"]["hostId"], "usr_host");
}

#[tokio::test]
async fn health_reports_instance_state() {
    let (server, cluster) = start_server().await;
    cluster.add_user("h");
    let (_ws, _) = server.connect("h").await;

    let api = TestServer::new(roomcast_gateway::routes::router().with_state(server.state.clone()))
        .unwrap();
    let resp = api.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["instanceId"], "gwi_test");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["pollingSessions"], 0);
    assert_eq!(body["online"], 1);
}
