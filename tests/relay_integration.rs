//! End-to-end relay tests: a real server, real WebSocket clients.

use codehive::client::{AgentClient, AgentConfig};
use codehive::ids::is_valid_room_code;
use codehive::protocol::{
    decode_server, encode_client, ChangeKind, ClientBody, ClientFrame, FileChange, MemberStatus,
    ServerBody, ServerFrame,
};
use codehive::server::{RelayConfig, RelayServer};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16, persist: PathBuf) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".to_string(),
        port,
        persist_path: persist,
        heartbeat_sweep_ms: 100,
        heartbeat_timeout_ms: 300,
        expiry_check_ms: 60_000,
        persist_interval_ms: 60_000,
    }
}

/// Start a relay on a free port; returns the port and a handle to its
/// registry for assertions.
async fn start_test_server() -> (u16, Arc<RelayServer>) {
    let port = free_port().await;
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(RelayServer::new(test_config(
        port,
        dir.path().join("rooms.json"),
    )));
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
        drop(dir); // keep the tempdir alive as long as the server
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

/// Thin raw WebSocket client speaking the envelope protocol.
struct TestClient {
    device_id: String,
    tx: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    rx: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .expect("connect to test relay");
        let (tx, rx) = ws.split();
        Self {
            device_id: codehive::ids::generate_device_id(),
            tx,
            rx,
        }
    }

    async fn send(&mut self, body: ClientBody) {
        let frame = ClientFrame::new(self.device_id.clone(), body);
        self.tx
            .send(Message::Text(encode_client(&frame).unwrap().into()))
            .await
            .expect("send frame");
    }

    async fn send_raw(&mut self, text: &str) {
        self.tx
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send raw");
    }

    /// Next decoded frame, or `None` after `wait`.
    async fn recv(&mut self, wait: Duration) -> Option<ServerFrame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match timeout(remaining, self.rx.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return decode_server(text.as_str()).ok();
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    /// Skip frames until one matches, or `None` after `wait`.
    async fn recv_until(
        &mut self,
        wait: Duration,
        pred: impl Fn(&ServerFrame) -> bool,
    ) -> Option<ServerFrame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let frame = self.recv(remaining).await?;
            if pred(&frame) {
                return Some(frame);
            }
        }
    }

    async fn create_room(
        &mut self,
        name: &str,
        password: Option<&str>,
        is_public: bool,
        branch: Option<&str>,
    ) -> String {
        self.send(ClientBody::CreateRoom {
            name: name.to_string(),
            password: password.map(str::to_string),
            is_public,
            expires_in_hours: 24,
            branch: branch.map(str::to_string),
        })
        .await;
        let frame = self
            .recv_until(Duration::from_secs(2), |f| {
                matches!(f.body, ServerBody::RoomCreated { .. })
            })
            .await
            .expect("room_created");
        match frame.body {
            ServerBody::RoomCreated { room, .. } => room.code,
            _ => unreachable!(),
        }
    }

    async fn join_room(
        &mut self,
        code: &str,
        name: &str,
        password: Option<&str>,
        branch: Option<&str>,
    ) {
        self.send(ClientBody::JoinRoom {
            code: code.to_string(),
            name: name.to_string(),
            password: password.map(str::to_string),
            branch: branch.map(str::to_string),
        })
        .await;
        self.recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::RoomJoined { .. })
        })
        .await
        .expect("room_joined");
    }
}

fn change(path: &str, device_id: &str, author: &str) -> FileChange {
    FileChange {
        path: path.to_string(),
        kind: ChangeKind::Change,
        author: author.to_string(),
        device_id: device_id.to_string(),
        timestamp: codehive::ids::now_ms(),
        diff: Some("+ edited".to_string()),
        lines_added: 1,
        lines_removed: 0,
        size_before: None,
        size_after: None,
    }
}

#[tokio::test]
async fn test_create_and_join_with_password_and_branch_warning() {
    let (port, _server) = start_test_server().await;

    // Zeus creates a protected public room on branch main.
    let mut zeus = TestClient::connect(port).await;
    zeus.send(ClientBody::CreateRoom {
        name: "Zeus".to_string(),
        password: Some("secret123".to_string()),
        is_public: true,
        expires_in_hours: 24,
        branch: Some("main".to_string()),
    })
    .await;
    let created = zeus
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::RoomCreated { .. })
        })
        .await
        .expect("room_created");
    let (code, invite) = match created.body {
        ServerBody::RoomCreated { room, invite_link } => {
            assert!(is_valid_room_code(&room.code), "bad code {}", room.code);
            assert!(room.has_password);
            assert!(room.is_public);
            assert_eq!(room.expires_in_hours, 24);
            assert_eq!(room.members.len(), 1);
            (room.code, invite_link)
        }
        _ => unreachable!(),
    };
    assert!(invite.contains(&format!("/join/{code}")), "{invite}");
    assert!(invite.contains("password=secret123"), "{invite}");

    // Alice tries the wrong password.
    let mut alice = TestClient::connect(port).await;
    alice
        .send(ClientBody::JoinRoom {
            code: code.clone(),
            name: "Alice".to_string(),
            password: Some("wrong".to_string()),
            branch: Some("feature".to_string()),
        })
        .await;
    let err = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::Error { .. })
        })
        .await
        .expect("error frame");
    match err.body {
        ServerBody::Error { message, .. } => assert!(message.contains("Wrong password"), "{message}"),
        _ => unreachable!(),
    }

    // Retry with the right password on a diverging branch.
    alice
        .join_room(&code, "Alice", Some("secret123"), Some("feature"))
        .await;

    // Zeus sees the join, then the divergence warning.
    let joined = zeus
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::MemberJoined { .. })
        })
        .await
        .expect("member_joined");
    match joined.body {
        ServerBody::MemberJoined { member, .. } => assert_eq!(member.name, "Alice"),
        _ => unreachable!(),
    }
    let warning = zeus
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::BranchWarning { .. })
        })
        .await
        .expect("branch_warning");
    match warning.body {
        ServerBody::BranchWarning { branches, .. } => {
            assert_eq!(branches.get("Zeus").map(String::as_str), Some("main"));
            assert_eq!(branches.get("Alice").map(String::as_str), Some("feature"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_conflict_on_shared_working_file() {
    let (port, _server) = start_test_server().await;
    let mut zeus = TestClient::connect(port).await;
    let code = zeus.create_room("Zeus", None, false, None).await;
    let mut alice = TestClient::connect(port).await;
    alice.join_room(&code, "Alice", None, None).await;

    zeus.send(ClientBody::DeclareWorking {
        code: code.clone(),
        files: vec!["same.ts".to_string()],
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice
        .send(ClientBody::DeclareWorking {
            code: code.clone(),
            files: vec!["same.ts".to_string()],
        })
        .await;

    let warning = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(&f.body, ServerBody::ConflictWarning { file, .. } if file == "same.ts")
        })
        .await
        .expect("conflict_warning");
    match warning.body {
        ServerBody::ConflictWarning { authors, .. } => {
            assert!(authors.contains(&"Zeus".to_string()), "{authors:?}");
            assert!(authors.contains(&"Alice".to_string()), "{authors:?}");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_lock_blocks_change_until_unlock() {
    let (port, _server) = start_test_server().await;
    let mut zeus = TestClient::connect(port).await;
    let code = zeus.create_room("Zeus", None, false, None).await;
    let mut alice = TestClient::connect(port).await;
    alice.join_room(&code, "Alice", None, None).await;

    // Zeus locks; Alice sees file_locked.
    zeus.send(ClientBody::LockFile {
        code: code.clone(),
        file: "src/config.ts".to_string(),
    })
    .await;
    let locked = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::FileLocked { .. })
        })
        .await
        .expect("file_locked");
    match locked.body {
        ServerBody::FileLocked { lock, .. } => {
            assert_eq!(lock.file, "src/config.ts");
            assert_eq!(lock.locked_by, "Zeus");
        }
        _ => unreachable!(),
    }

    // Alice's competing lock is refused with the holder's name.
    alice
        .send(ClientBody::LockFile {
            code: code.clone(),
            file: "src/config.ts".to_string(),
        })
        .await;
    let lock_err = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::LockError { .. })
        })
        .await
        .expect("lock_error");
    match lock_err.body {
        ServerBody::LockError { locked_by, .. } => {
            assert_eq!(locked_by.as_deref(), Some("Zeus"));
        }
        _ => unreachable!(),
    }

    // Alice's write to the locked file is rejected and not broadcast.
    let alice_device = alice.device_id.clone();
    alice
        .send(ClientBody::FileChange {
            code: code.clone(),
            change: change("src/config.ts", &alice_device, "Alice"),
        })
        .await;
    let err = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::Error { .. })
        })
        .await
        .expect("error frame");
    match err.body {
        ServerBody::Error { message, .. } => assert!(message.contains("locked"), "{message}"),
        _ => unreachable!(),
    }
    let leaked = zeus
        .recv_until(Duration::from_millis(300), |f| {
            matches!(f.body, ServerBody::FileChanged { .. })
        })
        .await;
    assert!(leaked.is_none(), "blocked change must not be broadcast");

    // Unlock reaches Alice.
    zeus.send(ClientBody::UnlockFile {
        code: code.clone(),
        file: "src/config.ts".to_string(),
    })
    .await;
    let unlocked = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::FileUnlocked { .. })
        })
        .await
        .expect("file_unlocked");
    match unlocked.body {
        ServerBody::FileUnlocked { file, .. } => assert_eq!(file, "src/config.ts"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_heartbeat_timeout_reaps_member_and_prunes_room() {
    let (port, server) = start_test_server().await;
    let mut zeus = TestClient::connect(port).await;
    let code = zeus.create_room("Zeus", None, false, None).await;
    let mut alice = TestClient::connect(port).await;
    alice.join_room(&code, "Alice", None, None).await;

    // Alice keeps heartbeating; Zeus goes silent and is evicted.
    let member_left = {
        let code = code.clone();
        async move {
            loop {
                alice
                    .send(ClientBody::Heartbeat {
                        code: code.clone(),
                        status: MemberStatus::Active,
                        branch: None,
                    })
                    .await;
                if let Some(frame) = alice
                    .recv_until(Duration::from_millis(100), |f| {
                        matches!(f.body, ServerBody::MemberLeft { .. })
                    })
                    .await
                {
                    return frame;
                }
            }
        }
    };
    let frame = timeout(Duration::from_secs(3), member_left)
        .await
        .expect("member_left within one sweep of the timeout");
    match frame.body {
        ServerBody::MemberLeft { name, .. } => assert_eq!(name, "Zeus"),
        _ => unreachable!(),
    }

    // Once Alice goes silent too, the emptied room is pruned.
    timeout(Duration::from_secs(3), async {
        loop {
            if !server.registry().has_room(&code).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("room pruned after last member reaped");
}

#[tokio::test]
async fn test_reconnect_rejoins_and_flushes_queue_in_order() {
    let port = free_port().await;
    let dir = tempfile::tempdir().unwrap();
    let persist = dir.path().join("rooms.json");

    // First relay incarnation runs on its own runtime so it can be killed.
    let first_rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let first = Arc::new(RelayServer::new(test_config(port, persist.clone())));
    {
        let server = first.clone();
        first_rt.spawn(async move {
            let _ = server.run().await;
        });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The agent creates a room through the first relay.
    let agent = AgentClient::new(AgentConfig {
        host: "127.0.0.1".to_string(),
        port,
        name: "Zeus".to_string(),
        reconnect_base_ms: 150,
        ..AgentConfig::default()
    });
    agent.connect().await.expect("agent connects");
    let (room, _invite) = agent
        .create_room(None, false, 0)
        .await
        .expect("room created");

    // Simulate the 60 s tick, then kill the relay (all its connections die
    // with its runtime).
    first.persist_now().await;
    first_rt.shutdown_background();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!agent.is_connected());

    // Three changes arrive from the watcher while offline.
    for path in ["a.rs", "b.rs", "c.rs"] {
        agent
            .report_file_change(change(path, agent.device_id(), "Zeus"))
            .await;
    }
    assert_eq!(agent.queued_changes().await, 3);

    // Second incarnation on the same port recovers the room from disk.
    let second = Arc::new(RelayServer::new(test_config(port, persist)));
    {
        let server = second.clone();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
    }

    // The agent rejoins with remembered credentials and flushes in order.
    timeout(Duration::from_secs(10), async {
        loop {
            if agent.queued_changes().await == 0 && agent.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("agent reconnected and flushed");

    let recovered = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(room) = second.registry().get_room(&room.code).await {
                let guard = room.read().await;
                let changes: Vec<String> =
                    guard.recent_changes().map(|c| c.path.clone()).collect();
                if changes.len() == 3 {
                    return changes;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("flushed changes recorded");
    assert_eq!(recovered, vec!["a.rs", "b.rs", "c.rs"]);

    agent.disconnect().await;
}

#[tokio::test]
async fn test_public_room_discovery_and_visibility_toggle() {
    let (port, _server) = start_test_server().await;
    let mut zeus = TestClient::connect(port).await;
    let code = zeus.create_room("Zeus", None, true, None).await;

    let mut carol = TestClient::connect(port).await;
    carol.send(ClientBody::ListRooms {}).await;
    let listing = carol
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::RoomList { .. })
        })
        .await
        .expect("room_list");
    match listing.body {
        ServerBody::RoomList { rooms } => {
            assert!(rooms.iter().any(|r| r.code == code), "{rooms:?}");
        }
        _ => unreachable!(),
    }

    // Hide the room; it disappears from discovery.
    zeus.send(ClientBody::SetRoomVisibility {
        code: code.clone(),
        is_public: false,
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    carol.send(ClientBody::ListRooms {}).await;
    let listing = carol
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::RoomList { .. })
        })
        .await
        .expect("room_list");
    match listing.body {
        ServerBody::RoomList { rooms } => {
            assert!(rooms.iter().all(|r| r.code != code), "{rooms:?}");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_malformed_frames_answered_in_band() {
    let (port, _server) = start_test_server().await;
    let mut client = TestClient::connect(port).await;

    client.send_raw("this is not json").await;
    let err = client.recv(Duration::from_secs(2)).await.expect("error");
    match err.body {
        ServerBody::Error { message, .. } => {
            assert_eq!(message, "Invalid message format");
        }
        other => panic!("expected error frame, got {other:?}"),
    }

    client.send_raw(r#"{"deviceId":"x","timestamp":1}"#).await;
    let err = client.recv(Duration::from_secs(2)).await.expect("error");
    assert!(matches!(err.body, ServerBody::Error { .. }));

    // The connection survived both bad frames.
    let code = client.create_room("Zeus", None, false, None).await;
    assert!(is_valid_room_code(&code));
}

#[tokio::test]
async fn test_validation_boundaries() {
    let (port, _server) = start_test_server().await;
    let mut client = TestClient::connect(port).await;

    // Name length 0 and 51 are rejected.
    for bad_name in [String::new(), "x".repeat(51)] {
        client
            .send(ClientBody::CreateRoom {
                name: bad_name,
                password: None,
                is_public: false,
                expires_in_hours: 0,
                branch: None,
            })
            .await;
        let err = client.recv(Duration::from_secs(2)).await.expect("error");
        assert!(matches!(err.body, ServerBody::Error { .. }));
    }

    let code = client.create_room("Zeus", None, false, None).await;

    // Chat of 10 001 characters is rejected.
    client
        .send(ClientBody::ChatMessage {
            code: code.clone(),
            content: "x".repeat(10_001),
        })
        .await;
    let err = client.recv(Duration::from_secs(2)).await.expect("error");
    assert!(matches!(err.body, ServerBody::Error { .. }));

    // 101 declared files are rejected.
    client
        .send(ClientBody::DeclareWorking {
            code: code.clone(),
            files: (0..101).map(|i| format!("f{i}.rs")).collect(),
        })
        .await;
    let err = client.recv(Duration::from_secs(2)).await.expect("error");
    assert!(matches!(err.body, ServerBody::Error { .. }));

    // A 501-character path is rejected.
    client
        .send(ClientBody::DeclareWorking {
            code: code.clone(),
            files: vec!["p".repeat(501)],
        })
        .await;
    let err = client.recv(Duration::from_secs(2)).await.expect("error");
    assert!(matches!(err.body, ServerBody::Error { .. }));

    // Terminal output of 50 001 characters is rejected.
    client
        .send(ClientBody::ShareTerminal {
            code: code.clone(),
            output: "o".repeat(50_001),
        })
        .await;
    let err = client.recv(Duration::from_secs(2)).await.expect("error");
    assert!(matches!(err.body, ServerBody::Error { .. }));
}

#[tokio::test]
async fn test_status_chat_timeline_flow() {
    let (port, _server) = start_test_server().await;
    let mut zeus = TestClient::connect(port).await;
    let code = zeus.create_room("Zeus", None, false, None).await;
    let mut alice = TestClient::connect(port).await;
    alice.join_room(&code, "Alice", None, None).await;

    zeus.send(ClientBody::ChatMessage {
        code: code.clone(),
        content: "morning".to_string(),
    })
    .await;
    let chat = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::ChatReceived { .. })
        })
        .await
        .expect("chat_received");
    match chat.body {
        ServerBody::ChatReceived { author, content, .. } => {
            assert_eq!(author, "Zeus");
            assert_eq!(content, "morning");
        }
        _ => unreachable!(),
    }

    alice
        .send(ClientBody::RequestStatus { code: code.clone() })
        .await;
    let status = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::RoomStatus { .. })
        })
        .await
        .expect("room_status");
    match status.body {
        ServerBody::RoomStatus { room } => {
            assert_eq!(room.members.len(), 2);
            assert!(room
                .timeline
                .iter()
                .any(|e| e.detail.contains("morning")));
        }
        _ => unreachable!(),
    }

    alice
        .send(ClientBody::GetTimeline {
            code: code.clone(),
            limit: Some(2),
        })
        .await;
    let tl = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::Timeline { .. })
        })
        .await
        .expect("timeline");
    match tl.body {
        ServerBody::Timeline { events, .. } => {
            assert_eq!(events.len(), 2);
            assert!(events[0].id < events[1].id);
        }
        _ => unreachable!(),
    }

    // Read-style request against a vanished room is owed an error.
    alice
        .send(ClientBody::RequestStatus {
            code: "HIVE-QQQQQQ".to_string(),
        })
        .await;
    let err = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::Error { .. })
        })
        .await
        .expect("error");
    match err.body {
        ServerBody::Error { message, .. } => assert!(message.contains("Room not found")),
        _ => unreachable!(),
    }
}

/// Minimal HTTP sink: accepts one POST, returns 200, hands back the body.
async fn http_capture_server() -> (u16, tokio::sync::oneshot::Receiver<String>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let Ok(n) = stream.read(&mut chunk).await else {
                return;
            };
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length: ").or_else(|| l.strip_prefix("Content-Length: ")))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    let body = text[header_end + 4..header_end + 4 + content_length].to_string();
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                    let _ = tx.send(body);
                    return;
                }
            }
        }
    });
    (port, rx)
}

#[tokio::test]
async fn test_webhook_fires_for_subscribed_chat_event() {
    let (port, _server) = start_test_server().await;
    let (hook_port, body_rx) = http_capture_server().await;

    let mut zeus = TestClient::connect(port).await;
    let code = zeus.create_room("Zeus", None, false, None).await;
    zeus.send(ClientBody::SetWebhook {
        code: code.clone(),
        url: Some(format!("http://127.0.0.1:{hook_port}/hook")),
        events: vec!["chat".to_string()],
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    zeus.send(ClientBody::ChatMessage {
        code: code.clone(),
        content: "ping the hook".to_string(),
    })
    .await;

    let body = timeout(Duration::from_secs(5), body_rx)
        .await
        .expect("webhook delivered")
        .expect("capture server alive");
    let payload: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(payload["event"], "chat");
    assert_eq!(payload["room"], code.as_str());
    assert_eq!(payload["author"], "Zeus");
    assert_eq!(payload["content"], "ping the hook");
    assert!(payload["timestamp"].is_u64());
}

#[tokio::test]
async fn test_typing_and_cursor_fanout_excludes_sender() {
    let (port, _server) = start_test_server().await;
    let mut zeus = TestClient::connect(port).await;
    let code = zeus.create_room("Zeus", None, false, None).await;
    let mut alice = TestClient::connect(port).await;
    alice.join_room(&code, "Alice", None, None).await;

    zeus.send(ClientBody::DeclareTyping {
        code: code.clone(),
        file: Some("src/lib.rs".to_string()),
    })
    .await;
    let typing = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::TypingIndicator { .. })
        })
        .await
        .expect("typing_indicator");
    match typing.body {
        ServerBody::TypingIndicator { name, file, .. } => {
            assert_eq!(name, "Zeus");
            assert_eq!(file.as_deref(), Some("src/lib.rs"));
        }
        _ => unreachable!(),
    }

    zeus.send(ClientBody::UpdateCursor {
        code: code.clone(),
        cursor: Some(codehive::protocol::CursorPos {
            file: "src/lib.rs".to_string(),
            line: 42,
            column: 7,
            end_line: None,
            end_column: None,
        }),
    })
    .await;
    let cursor = alice
        .recv_until(Duration::from_secs(2), |f| {
            matches!(f.body, ServerBody::CursorUpdated { .. })
        })
        .await
        .expect("cursor_updated");
    match cursor.body {
        ServerBody::CursorUpdated { cursor, .. } => {
            let cursor = cursor.expect("cursor set");
            assert_eq!(cursor.line, 42);
            assert_eq!(cursor.column, 7);
        }
        _ => unreachable!(),
    }

    // The sender hears neither of its own hints.
    let echoed = zeus
        .recv_until(Duration::from_millis(300), |f| {
            matches!(
                f.body,
                ServerBody::TypingIndicator { .. } | ServerBody::CursorUpdated { .. }
            )
        })
        .await;
    assert!(echoed.is_none(), "sender must not hear its own hints");
}
