mod common;

use std::time::Duration;

use serde_json::json;

use common::{start_server, start_server_with, test_settings, WsClient};
use roomcast_common::protocol::close_code;
use roomcast_common::RoomName;
use roomcast_gateway::bus::DisconnectReason;
use roomcast_gateway::ratelimit::RateLimitPolicy;
use roomcast_gateway::store::PresenceStore;

#[tokio::test]
async fn valid_credential_becomes_active_in_personal_room() {
    let (server, cluster) = start_server().await;
    cluster.add_user("alice");

    let (_ws, connected) = server.connect("alice").await;
    assert_eq!(connected["user"]["id"], "alice");
    assert_eq!(connected["instanceId"], "gwi_test");
    let connection_id = connected["connectionId"].as_str().unwrap().to_string();
    assert!(connection_id.starts_with("conn_"));

    let personal = RoomName::user("alice").unwrap();
    assert!(server.gateway.registry.is_member(&connection_id, &personal));
    assert_eq!(
        cluster.store.list_room_members(&personal).await.unwrap(),
        vec!["alice"]
    );
    assert!(cluster.store.is_online("alice").await.unwrap());
}

#[tokio::test]
async fn missing_or_unknown_credential_is_rejected() {
    let (server, _cluster) = start_server().await;

    let mut anonymous = WsClient::open(&server.ws_url(), None).await;
    let (code, reason) = anonymous.expect_close().await;
    assert_eq!(code, close_code::AUTH_FAILED);
    assert_eq!(reason, "auth_failed");

    let mut unknown = WsClient::open(&server.ws_url(), Some("cred-nobody")).await;
    assert_eq!(unknown.expect_close().await.0, close_code::AUTH_FAILED);
    assert_eq!(server.gateway.registry.connection_count(), 0);
}

#[tokio::test]
async fn banned_principal_never_becomes_active() {
    let (server, cluster) = start_server().await;
    cluster.add_banned_user("mallory");

    let mut ws = WsClient::open(&server.ws_url(), Some("cred-mallory")).await;
    let (code, reason) = ws.expect_close().await;
    assert_eq!(code, close_code::BANNED);
    assert_eq!(reason, "banned");
    assert!(!cluster.store.is_online("mallory").await.unwrap());
}

#[tokio::test]
async fn credential_from_query_string() {
    let (server, cluster) = start_server().await;
    cluster.add_user("qs");

    let url = format!("{}?token=cred-qs", server.ws_url());
    let mut ws = WsClient::open(&url, None).await;
    let connected = ws.expect("connected").await;
    assert_eq!(connected["user"]["id"], "qs");
}

#[tokio::test]
async fn connection_attempts_are_rate_limited() {
    let settings = roomcast_gateway::config::GatewaySettings {
        connect_limit: RateLimitPolicy::new(2, Duration::from_secs(60)),
        ..test_settings()
    };
    let (server, cluster) = start_server_with(settings).await;
    cluster.add_user("eager");

    let (_a, _) = server.connect("eager").await;
    let (_b, _) = server.connect("eager").await;
    let mut third = WsClient::open(&server.ws_url(), Some("cred-eager")).await;
    let (code, reason) = third.expect_close().await;
    assert_eq!(code, close_code::RATE_LIMITED);
    assert_eq!(reason, "rate_limited");
}

/// Two viewers of a post: typing is relayed to the other one only, and a
/// disconnect removes the viewer from the room.
#[tokio::test]
async fn post_room_typing_and_viewers() {
    let (server, cluster) = start_server().await;
    cluster.add_user("a");
    cluster.add_user("b");

    let (mut a, _) = server.connect("a").await;
    let (mut b, _) = server.connect("b").await;

    a.send("room:join", json!({"room": "42", "roomType": "post"})).await;
    let joined = a.expect("room:joined").await;
    assert_eq!(joined["room"], "post:42");
    assert_eq!(joined["members"], json!(["a"]));
    a.expect("post:viewers").await;

    b.send("room:join", json!({"room": "42", "roomType": "post"})).await;
    let joined = b.expect("room:joined").await;
    assert_eq!(joined["members"], json!(["a", "b"]));
    let viewers = b.expect("post:viewers").await;
    assert_eq!(viewers["viewers"], json!(["a", "b"]));

    a.send("comment:typing:start", json!({"room": "post:42"})).await;
    let typing = b.expect("comment:typing").await;
    assert_eq!(typing["userId"], "a");
    assert_eq!(typing["username"], "a name");
    assert_eq!(typing["isTyping"], true);
    assert_eq!(typing["room"], "post:42");
    b.expect_none("comment:typing", Duration::from_millis(300)).await;
    a.expect_none("comment:typing", Duration::from_millis(100)).await;

    a.close().await;
    let viewers = b.expect("post:viewers").await;
    assert_eq!(viewers["viewers"], json!(["b"]));
    let room = RoomName::post("42").unwrap();
    assert_eq!(cluster.store.list_room_members(&room).await.unwrap(), vec!["b"]);
}

#[tokio::test]
async fn typing_requires_membership() {
    let (server, cluster) = start_server().await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    a.send("comment:typing:start", json!({"room": "post:42"})).await;
    let err = a.expect("error").await;
    assert_eq!(err["errorCode"], "UNAUTHORIZED");
}

#[tokio::test]
async fn typing_is_rejected_outside_post_rooms() {
    let (server, cluster) = start_server().await;
    cluster.add_user("alice");
    cluster.add_user("bob");
    cluster.add_user("carol");
    cluster.persistence.set_following("bob", &["alice"]);
    cluster.persistence.set_following("carol", &["alice"]);

    let (mut bob, _) = server.connect("bob").await;
    let (mut carol, _) = server.connect("carol").await;

    // Both follow alice, so both sit in her activity room.
    bob.send("comment:typing:start", json!({"room": "user:alice:activity"}))
        .await;
    assert_eq!(bob.expect("error").await["errorCode"], "VALIDATION_FAILED");

    bob.send("comment:typing:start", json!({"room": "user:bob"})).await;
    assert_eq!(bob.expect("error").await["errorCode"], "VALIDATION_FAILED");

    bob.send("room:join", json!({"room": "chat:general"})).await;
    bob.expect("room:joined").await;
    bob.send("comment:typing:start", json!({"room": "chat:general"})).await;
    assert_eq!(bob.expect("error").await["errorCode"], "VALIDATION_FAILED");

    carol
        .expect_none("comment:typing", Duration::from_millis(300))
        .await;
}

#[tokio::test]
async fn invalid_events_report_errors_and_keep_the_connection() {
    let (server, cluster) = start_server().await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    a.send("room:join", json!({"room": "a", "roomType": "user"})).await;
    assert_eq!(a.expect("error").await["errorCode"], "VALIDATION_FAILED");

    a.send("room:join", json!({"room": "1", "roomType": "lobby"})).await;
    assert_eq!(a.expect("error").await["errorCode"], "VALIDATION_FAILED");

    a.send("no:such:event", json!({})).await;
    assert_eq!(a.expect("error").await["errorCode"], "VALIDATION_FAILED");

    a.send_raw("not json").await;
    assert_eq!(a.expect("error").await["errorCode"], "VALIDATION_FAILED");

    a.send("room:join", json!({"room": "chat:general"})).await;
    assert_eq!(a.expect("room:joined").await["room"], "chat:general");
}

#[tokio::test]
async fn events_are_rate_limited_per_identity() {
    let settings = roomcast_gateway::config::GatewaySettings {
        event_limit: RateLimitPolicy::new(3, Duration::from_secs(60)),
        ..test_settings()
    };
    let (server, cluster) = start_server_with(settings).await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    for _ in 0..3 {
        a.send("room:join", json!({"room": "post:1"})).await;
        a.expect("room:joined").await;
    }
    a.send("room:join", json!({"room": "post:1"})).await;
    let err = a.expect("error").await;
    assert_eq!(err["errorCode"], "RATE_LIMITED");
    assert!(err["retryAfterMs"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn malformed_frames_spend_the_event_budget() {
    let settings = roomcast_gateway::config::GatewaySettings {
        event_limit: RateLimitPolicy::new(3, Duration::from_secs(60)),
        ..test_settings()
    };
    let (server, cluster) = start_server_with(settings).await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    a.send_raw("not json").await;
    assert_eq!(a.expect("error").await["errorCode"], "VALIDATION_FAILED");
    a.send("no:such:event", json!({})).await;
    assert_eq!(a.expect("error").await["errorCode"], "VALIDATION_FAILED");
    a.send("room:join", json!({"room": "post:1"})).await;
    a.expect("room:joined").await;

    a.send_raw("{").await;
    assert_eq!(a.expect("error").await["errorCode"], "RATE_LIMITED");
    a.send("room:join", json!({"room": "post:1"})).await;
    assert_eq!(a.expect("error").await["errorCode"], "RATE_LIMITED");
}

#[tokio::test]
async fn followers_see_online_and_offline() {
    let (server, cluster) = start_server().await;
    cluster.add_user("alice");
    cluster.add_user("bob");
    cluster.persistence.set_following("bob", &["alice"]);

    let (mut bob, connected) = server.connect("bob").await;
    assert_eq!(connected["onlineFriends"], json!([]));

    let (alice, _) = server.connect("alice").await;
    let online = bob.expect("user:online").await;
    assert_eq!(online["userId"], "alice");

    // A second tab does not announce again, and closing it keeps alice online.
    let (alice_tab, _) = server.connect("alice").await;
    alice_tab.close().await;
    bob.expect_none("user:offline", Duration::from_millis(300)).await;

    alice.close().await;
    let offline = bob.expect("user:offline").await;
    assert_eq!(offline["userId"], "alice");
    assert!(!cluster.store.is_online("alice").await.unwrap());
}

#[tokio::test]
async fn online_friends_listed_on_connect() {
    let (server, cluster) = start_server().await;
    cluster.add_user("alice");
    cluster.add_user("bob");
    cluster.add_user("carol");
    cluster.persistence.set_following("bob", &["alice", "carol"]);

    let (_alice, _) = server.connect("alice").await;
    let (_bob, connected) = server.connect("bob").await;
    assert_eq!(connected["onlineFriends"], json!(["alice"]));
}

#[tokio::test]
async fn presence_update_reaches_followers() {
    let (server, cluster) = start_server().await;
    cluster.add_user("alice");
    cluster.add_user("bob");
    cluster.persistence.set_following("bob", &["alice"]);

    let (mut bob, _) = server.connect("bob").await;
    let (mut alice, _) = server.connect("alice").await;

    alice
        .send(
            "presence:update",
            json!({"status": "dnd", "location": "post:42", "locationType": "post"}),
        )
        .await;
    let update = bob.expect("presence:update").await;
    assert_eq!(update["userId"], "alice");
    assert_eq!(update["status"], "dnd");
    assert_eq!(update["location"], "post:42");
    assert_eq!(
        cluster.store.get_status("alice").await.unwrap().as_deref(),
        Some("dnd")
    );

    alice.send("presence:update", json!({"status": "sleeping"})).await;
    assert_eq!(alice.expect("error").await["errorCode"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn stale_presence_is_swept_and_announced() {
    let settings = roomcast_gateway::config::GatewaySettings {
        presence_max_age: Duration::from_millis(300),
        presence_refresh_interval: Duration::ZERO,
        ping_interval: Duration::from_secs(60),
        ..test_settings()
    };
    let (server, cluster) = start_server_with(settings).await;
    cluster.add_user("alice");
    cluster.add_user("bob");
    cluster.persistence.set_following("bob", &["alice"]);

    let (mut bob, _) = server.connect("bob").await;
    let (mut alice, _) = server.connect("alice").await;
    alice.send("room:join", json!({"room": "post:7"})).await;
    alice.expect("room:joined").await;
    bob.send("room:join", json!({"room": "post:7"})).await;
    assert_eq!(
        bob.expect("post:viewers").await["viewers"],
        json!(["alice", "bob"])
    );

    // alice goes quiet past the max age, bob keeps talking.
    tokio::time::sleep(Duration::from_millis(400)).await;
    bob.send("room:join", json!({"room": "chat:lobby"})).await;
    bob.expect("room:joined").await;

    roomcast_gateway::gateway::presence::sweep_once(&server.gateway).await;

    assert_eq!(bob.expect("post:viewers").await["viewers"], json!(["bob"]));
    assert_eq!(bob.expect("user:offline").await["userId"], "alice");
    assert_eq!(bob.expect("online:count").await["count"], 1);

    assert!(!cluster.store.is_online("alice").await.unwrap());
    assert!(cluster.store.is_online("bob").await.unwrap());
    let post = RoomName::post("7").unwrap();
    assert_eq!(cluster.store.list_room_members(&post).await.unwrap(), vec!["bob"]);

    // A second sweep finds nothing left to do.
    roomcast_gateway::gateway::presence::sweep_once(&server.gateway).await;
    bob.expect_none("user:offline", Duration::from_millis(200)).await;
}

#[tokio::test]
async fn kicked_connections_receive_terminal_close() {
    let (server, cluster) = start_server().await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    server.gateway.disconnect_user("a", DisconnectReason::Kick);
    let (code, reason) = a.expect_close().await;
    assert_eq!(code, close_code::KICKED);
    assert_eq!(reason, "kicked");
    assert!(!close_code::is_retryable(code));

    assert!(common::eventually(|| server.gateway.registry.connection_count() == 0).await);
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let settings = roomcast_gateway::config::GatewaySettings {
        idle_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_secs(60),
        ..test_settings()
    };
    let (server, cluster) = start_server_with(settings).await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    let (code, reason) = a.expect_close().await;
    assert_eq!(code, close_code::IDLE_TIMEOUT);
    assert_eq!(reason, "idle_timeout");
}

#[tokio::test]
async fn post_views_are_flushed_to_persistence() {
    let (server, cluster) = start_server().await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    for _ in 0..3 {
        a.send("post:view", json!({"postId": "42"})).await;
    }
    a.send("room:join", json!({"room": "post:42"})).await;
    a.expect("room:joined").await;

    let flushed = roomcast_gateway::gateway::handlers::views::flush_once(&server.gateway).await;
    assert_eq!(flushed, 1);
    assert_eq!(cluster.persistence.views("42"), 3);
}

#[tokio::test]
async fn shutdown_asks_clients_to_reconnect() {
    let (server, cluster) = start_server().await;
    cluster.add_user("a");
    let (mut a, _) = server.connect("a").await;

    let gateway = server.gateway.clone();
    let shutdown = tokio::spawn(async move { gateway.shutdown(Duration::from_secs(2)).await });

    let (code, _) = a.expect_close().await;
    assert_eq!(code, close_code::RECONNECT);
    assert!(close_code::is_retryable(code));
    shutdown.await.unwrap();
    assert_eq!(server.gateway.registry.connection_count(), 0);
}
