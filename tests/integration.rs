//! End-to-end tests: a real server, real WebSocket clients, and the full
//! fan-out pipeline.
//!
//! These tests need live backing services at the default endpoints
//! (`redis://127.0.0.1/`, `mongodb://127.0.0.1:27017`) and are therefore
//! ignored by default:
//!
//! ```text
//! cargo test -- --ignored
//! ```
//!
//! Every test uses fresh UUID-based room and user IDs, so reruns do not
//! interfere with each other or with leftover state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use roomcast::auth;
use roomcast::{
    ChatMessage, ChatServer, ListOrder, Member, MessageKind, PresenceRegistry, ServerConfig,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_DB: &str = "db_chat_test";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, apply config tweaks, return it + the port.
async fn start_server(tweak: impl FnOnce(&mut ServerConfig)) -> (Arc<ChatServer>, u16) {
    let port = free_port().await;
    let mut config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        db_name: TEST_DB.to_string(),
        ..ServerConfig::default()
    };
    tweak(&mut config);

    let server = ChatServer::connect(config).await.expect("backing services must be up");
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give the server time to bind
    sleep(Duration::from_millis(50)).await;
    (server, port)
}

async fn connect_client(port: u16, room_id: &str, user_id: &str, nickname: &str) -> ClientSocket {
    let token = auth::issue_token(
        user_id,
        "user@example.com",
        nickname,
        Duration::from_secs(60),
        "secret-key",
    )
    .unwrap();
    let url = format!(
        "ws://127.0.0.1:{port}/ws?room_id={room_id}&user_id={user_id}&nickname={nickname}&token={token}"
    );
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Wait until the server-side session has registered presence, so that its
/// bus subscription is live before the test publishes anything.
async fn wait_for_presence(server: &ChatServer, user_id: &str) {
    let registry = PresenceRegistry::new(server.bus().clone(), server.config());
    for _ in 0..100 {
        if registry.lookup(user_id).await.unwrap_or(None).is_some() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("presence for {user_id} never appeared");
}

async fn send_text(ws: &mut ClientSocket, content: &str) {
    let frame = format!(r#"{{"type":"text","content":"{content}"}}"#);
    ws.send(Message::text(frame)).await.unwrap();
}

/// Next chat frame within the deadline, skipping non-text traffic.
async fn recv_frame(ws: &mut ClientSocket, deadline: Duration) -> Option<ChatMessage> {
    let result = timeout(deadline, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(raw) = msg {
                return ChatMessage::decode(&raw).ok();
            }
        }
        None
    })
    .await;
    result.ok().flatten()
}

fn fresh_ids() -> (String, String, String) {
    (
        format!("room-{}", Uuid::new_v4()),
        format!("user-{}", Uuid::new_v4()),
        format!("user-{}", Uuid::new_v4()),
    )
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_authorized_join_and_echo_suppression() {
    let (server, port) = start_server(|_| {}).await;
    let (room, u1, u2) = fresh_ids();
    server.store().add_member(&room, Member::new(&u1, "Alice")).await.unwrap();
    server.store().add_member(&room, Member::new(&u2, "Bob")).await.unwrap();

    let mut alice = connect_client(port, &room, &u1, "Alice").await;
    let mut bob = connect_client(port, &room, &u2, "Bob").await;
    wait_for_presence(&server, &u1).await;
    wait_for_presence(&server, &u2).await;

    send_text(&mut alice, "hi").await;

    let frame =
        recv_frame(&mut bob, Duration::from_secs(2)).await.expect("bob must receive the message");
    assert_eq!(frame.kind, MessageKind::Text);
    assert_eq!(frame.content, "hi");
    assert_eq!(frame.sender_id, u1);
    assert_eq!(frame.nickname, "Alice");

    // The sender never sees its own frame come back
    assert!(recv_frame(&mut alice, Duration::from_millis(500)).await.is_none());

    let history = server
        .store()
        .list_messages(&room, 10, 0, ListOrder::OldestFirst)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "hi");

    // Both sessions are in the room's members index
    let members_key = format!("room:{room}:members");
    assert_eq!(server.bus().scard(&members_key).await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_bus_primitives() {
    let (server, _port) = start_server(|_| {}).await;
    let bus = server.bus();
    let ns = Uuid::new_v4();

    // Sets
    let set_key = format!("test:{ns}:set");
    bus.sadd(&set_key, "a").await.unwrap();
    bus.sadd(&set_key, "b").await.unwrap();
    assert_eq!(bus.scard(&set_key).await.unwrap(), 2);
    bus.srem(&set_key, "a").await.unwrap();
    assert_eq!(bus.smembers(&set_key).await.unwrap(), vec!["b".to_string()]);

    // Hashes with expiry
    let hash_key = format!("test:{ns}:hash");
    bus.hset(&hash_key, &[("roomID", "r1".into()), ("lastSeen", "42".into())])
        .await
        .unwrap();
    bus.expire(&hash_key, Duration::from_secs(60)).await.unwrap();
    let fields = bus.hgetall(&hash_key).await.unwrap();
    assert_eq!(fields.get("roomID").map(String::as_str), Some("r1"));
    assert_eq!(fields.get("lastSeen").map(String::as_str), Some("42"));

    // Kv with millisecond TTL
    let kv_key = format!("test:{ns}:kv");
    bus.set_with_ttl(&kv_key, "stamp", Duration::from_millis(100)).await.unwrap();
    assert_eq!(bus.get(&kv_key).await.unwrap().as_deref(), Some("stamp"));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.get(&kv_key).await.unwrap(), None);

    // Sorted set, reverse range, scan, delete
    let zset_key = format!("test:{ns}:zset");
    bus.zadd(&zset_key, 1.0, "old").await.unwrap();
    bus.zadd(&zset_key, 2.0, "new").await.unwrap();
    assert_eq!(
        bus.zrevrange_by_score(&zset_key, 1).await.unwrap(),
        vec!["new".to_string()]
    );
    // The kv key has expired by now; set, hash, and zset remain
    let found = bus.scan_keys(&format!("test:{ns}:*")).await.unwrap();
    assert_eq!(found.len(), 3);
    for key in found {
        bus.del(&key).await.unwrap();
    }
    assert!(bus.scan_keys(&format!("test:{ns}:*")).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_unauthorized_user_is_refused() {
    let (server, port) = start_server(|_| {}).await;
    let (room, u1, u2) = fresh_ids();
    server.store().add_member(&room, Member::new(&u1, "Alice")).await.unwrap();

    // u2 holds a valid token but is not a member of the room
    let mut intruder = connect_client(port, &room, &u2, "Mallory").await;
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match intruder.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .unwrap();

    let frame = closed.expect("server must answer with a close frame");
    assert_eq!(frame.code, CloseCode::Error);

    // No presence was ever registered for the intruder
    let presence = server.bus().hgetall(&format!("client:{u2}")).await.unwrap();
    assert!(presence.is_empty());
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_lock_conflict_and_implicit_unlock() {
    let (server, port) = start_server(|_| {}).await;
    let (room, u1, u2) = fresh_ids();
    server.store().add_member(&room, Member::new(&u1, "Alice")).await.unwrap();
    server.store().add_member(&room, Member::new(&u2, "Bob")).await.unwrap();

    let mut alice = connect_client(port, &room, &u1, "Alice").await;
    let mut bob = connect_client(port, &room, &u2, "Bob").await;
    wait_for_presence(&server, &u1).await;
    wait_for_presence(&server, &u2).await;

    // Alice locks the room through the moderation entry point
    let outcome = server.engine().try_lock(&room, &u1).await.unwrap();
    assert_eq!(outcome, roomcast::LockOutcome::Locked);

    let locked = recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap();
    assert_eq!(locked.content, "Room has been locked by Alice");
    let locked = recv_frame(&mut alice, Duration::from_secs(2)).await.unwrap();
    assert_eq!(locked.kind, MessageKind::System);

    sleep(Duration::from_millis(50)).await;

    // Bob is refused privately; Alice sees nothing
    send_text(&mut bob, "hello").await;
    let refusal = recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap();
    assert_eq!(refusal.kind, MessageKind::System);
    assert_eq!(refusal.content, "Room is locked. Messages cannot be sent.");
    assert!(recv_frame(&mut alice, Duration::from_millis(300)).await.is_none());

    sleep(Duration::from_millis(50)).await;

    // The holder sending implicitly unlocks, then the message goes through
    send_text(&mut alice, "done").await;
    let unlock = recv_frame(&mut alice, Duration::from_secs(2)).await.unwrap();
    assert_eq!(unlock.content, "Room has been unlocked by Alice");
    let unlock = recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap();
    assert_eq!(unlock.content, "Room has been unlocked by Alice");
    let done = recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap();
    assert_eq!(done.content, "done");

    let history = server
        .store()
        .list_messages(&room, 10, 0, ListOrder::OldestFirst)
        .await
        .unwrap();
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "Room has been locked by Alice",
            "Room has been unlocked by Alice",
            "done",
        ]
    );
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_rate_limit_refuses_second_message() {
    let (server, port) = start_server(|_| {}).await;
    let (room, u1, u2) = fresh_ids();
    server.store().add_member(&room, Member::new(&u1, "Alice")).await.unwrap();
    server.store().add_member(&room, Member::new(&u2, "Bob")).await.unwrap();

    let mut alice = connect_client(port, &room, &u1, "Alice").await;
    let mut bob = connect_client(port, &room, &u2, "Bob").await;
    wait_for_presence(&server, &u1).await;
    wait_for_presence(&server, &u2).await;

    send_text(&mut alice, "one").await;
    assert_eq!(recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap().content, "one");

    sleep(Duration::from_millis(500)).await;
    send_text(&mut alice, "two").await;

    let refusal = recv_frame(&mut alice, Duration::from_secs(2)).await.unwrap();
    assert_eq!(refusal.kind, MessageKind::System);
    let wait: f64 = refusal
        .content
        .strip_prefix("Please wait ")
        .and_then(|rest| rest.split(' ').next())
        .and_then(|n| n.parse().ok())
        .expect("refusal must carry the remaining wait");
    assert!((0.7..=1.2).contains(&wait), "wait was {wait}");

    // The refused frame is not fanned out
    assert!(recv_frame(&mut bob, Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_oversize_message_refused() {
    let (server, port) = start_server(|_| {}).await;
    let (room, u1, _) = fresh_ids();
    server.store().add_member(&room, Member::new(&u1, "Alice")).await.unwrap();

    let mut alice = connect_client(port, &room, &u1, "Alice").await;
    wait_for_presence(&server, &u1).await;

    send_text(&mut alice, &"x".repeat(5001)).await;

    let refusal = recv_frame(&mut alice, Duration::from_secs(2)).await.unwrap();
    assert_eq!(refusal.kind, MessageKind::System);
    assert_eq!(
        refusal.content,
        "Message exceeds maximum length of 5000 characters"
    );

    let history = server
        .store()
        .list_messages(&room, 10, 0, ListOrder::OldestFirst)
        .await
        .unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_replay_before_live_on_reconnect() {
    let (server, port) = start_server(|_| {}).await;
    let (room, u1, u2) = fresh_ids();
    server.store().add_member(&room, Member::new(&u1, "Alice")).await.unwrap();
    server.store().add_member(&room, Member::new(&u2, "Bob")).await.unwrap();

    // 75 persisted messages, timestamps one second apart so the replay
    // buffer orders them unambiguously
    for i in 1..=75 {
        let mut msg = ChatMessage::text(&room, &u1, "Alice", format!("m{i}"));
        msg.timestamp = chrono::Utc::now() - chrono::TimeDelta::seconds(100 - i);
        server.engine().broadcast(&msg).await.unwrap();
    }

    let mut bob = connect_client(port, &room, &u2, "Bob").await;
    wait_for_presence(&server, &u2).await;

    // The newest 50 arrive first, in ascending order
    let first = recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap();
    assert_eq!(first.content, "m26");

    // Published while the replay window is still streaming out
    server
        .engine()
        .broadcast(&ChatMessage::text(&room, &u1, "Alice", "live"))
        .await
        .unwrap();

    for i in 27..=75 {
        let frame = recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap();
        assert_eq!(frame.content, format!("m{i}"));
    }
    // ...and only then the live frame
    let live = recv_frame(&mut bob, Duration::from_secs(2)).await.unwrap();
    assert_eq!(live.content, "live");
}

#[tokio::test]
#[ignore = "requires live Redis and MongoDB"]
async fn test_reaper_expires_stale_presence() {
    let (server, port) = start_server(|cfg| {
        cfg.stale_after_s = 2;
        cfg.reaper_period_s = 1;
        // Keep the live session comfortably fresher than the staleness
        // threshold while the dead entry ages out
        cfg.heartbeat_period_s = 1;
    })
    .await;
    let (room, u1, u2) = fresh_ids();
    server.store().add_member(&room, Member::new(&u1, "Alice")).await.unwrap();
    server.store().add_member(&room, Member::new(&u2, "Bob")).await.unwrap();

    let mut bob = connect_client(port, &room, &u2, "Bob").await;
    wait_for_presence(&server, &u2).await;

    // A presence entry whose heartbeat never fires
    let registry = PresenceRegistry::new(server.bus().clone(), server.config());
    registry.register(&u1, &room, "Alice", "conn-dead").await.unwrap();

    // Within staleness + one reaper period (plus slack) the entry is gone
    let notice = recv_frame(&mut bob, Duration::from_secs(6)).await.unwrap();
    assert_eq!(notice.kind, MessageKind::System);
    assert_eq!(notice.content, "Alice has disconnected (timeout)");

    let presence = server.bus().hgetall(&format!("client:{u1}")).await.unwrap();
    assert!(presence.is_empty());
    let members = server
        .bus()
        .smembers(&format!("room:{room}:members"))
        .await
        .unwrap();
    assert!(!members.contains(&u1));
    // Bob's live presence survived the sweep
    assert!(members.contains(&u2));
}
