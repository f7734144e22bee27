//! The relay server: room multiplexing over one WebSocket endpoint.
//!
//! Architecture:
//! ```text
//! Agent A ──┐                      ┌── member.tx ──► writer task ──► A
//!            ├── dispatch ──► Room ┤
//! Agent B ──┘    (per frame)       └── member.tx ──► writer task ──► B
//!                   │
//!                   ├── RoomRegistry (code → Arc<RwLock<Room>>)
//!                   ├── WebhookSender (fire-and-forget HTTP POST)
//!                   └── periodic tasks: heartbeat sweep · expiry sweep
//!                                       · persistence writer
//! ```
//!
//! Every room-mutating operation runs under that room's write lock; outbound
//! frames are queued to per-connection channels so no lock is held across
//! socket I/O. A single bad frame never tears down a connection — protocol
//! and validation failures are answered with in-band `error` frames.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::ids::now_ms;
use crate::protocol::{
    decode_client, encode_server, invite_link, ClientBody, CursorPos, FileChange, MemberStatus,
    ProtocolError, ServerBody, ServerFrame, DEFAULT_HOST, DEFAULT_PORT, ERR_INVALID_ARG,
    ERR_INVALID_FRAME, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_CHAT_LEN, MAX_FRAME_BYTES,
    MAX_NAME_LEN, MAX_PATH_LEN, MAX_TERMINAL_OUTPUT, MAX_WORKING_FILES, PERSIST_INTERVAL_MS,
    ROOM_EXPIRY_CHECK_MS,
};
use crate::registry::{PersistedRoom, RoomRegistry};
use crate::room::{set_typing, FrameSender, LockOutcome, SharedRoom, UnlockOutcome};
use crate::webhook::{WebhookConfig, WebhookSender};

/// Relay configuration. The sweep knobs exist so tests can shrink the
/// timing; production uses the protocol constants.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Persistence snapshot path; best-effort recovery only.
    pub persist_path: PathBuf,
    pub heartbeat_sweep_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub expiry_check_ms: u64,
    pub persist_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            persist_path: PathBuf::from("./.codehive-rooms.json"),
            heartbeat_sweep_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            expiry_check_ms: ROOM_EXPIRY_CHECK_MS,
            persist_interval_ms: PERSIST_INTERVAL_MS,
        }
    }
}

impl RelayConfig {
    /// Read `HOST` / `PORT` overrides from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        config
    }
}

/// Per-connection session: what the relay knows about the peer, updated
/// from every inbound frame.
#[derive(Default)]
struct Session {
    device_id: Option<String>,
    room_code: Option<String>,
}

pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    webhooks: WebhookSender,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RoomRegistry::new()),
            webhooks: WebhookSender::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Load the persistence snapshot, start the periodic tasks, accept
    /// connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.load_snapshot().await;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from {}", self.config.persist_path.display());
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        log::info!("Relay listening on ws://{addr}");

        self.spawn_heartbeat_sweep();
        self.spawn_expiry_sweep();
        self.spawn_persistence_writer();

        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = self.registry.clone();
            let webhooks = self.webhooks.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, registry, webhooks, config).await {
                    log::debug!("Connection from {peer} ended with error: {e}");
                }
            });
        }
    }

    /// Write the snapshot immediately (used by the 60 s tick and on clean
    /// shutdown).
    pub async fn persist_now(&self) {
        persist_snapshot(&self.registry, &self.config.persist_path).await;
    }

    async fn load_snapshot(&self) -> usize {
        let raw = match tokio::fs::read(&self.config.persist_path).await {
            Ok(raw) => raw,
            Err(_) => return 0,
        };
        let records: Vec<PersistedRoom> = match serde_json::from_slice(&raw) {
            Ok(records) => records,
            Err(e) => {
                log::warn!(
                    "Ignoring corrupt persistence file {}: {e}",
                    self.config.persist_path.display()
                );
                return 0;
            }
        };
        self.registry.load_persisted(records).await
    }

    fn spawn_heartbeat_sweep(&self) {
        let registry = self.registry.clone();
        let sweep_ms = self.config.heartbeat_sweep_ms;
        let timeout_ms = self.config.heartbeat_timeout_ms;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(sweep_ms));
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                sweep_dead_members(&registry, timeout_ms).await;
            }
        });
    }

    fn spawn_expiry_sweep(&self) {
        let registry = self.registry.clone();
        let check_ms = self.config.expiry_check_ms;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(check_ms));
            tick.tick().await;
            loop {
                tick.tick().await;
                let expired = registry.prune_expired_rooms().await;
                if !expired.is_empty() {
                    log::info!("Expired rooms pruned: {}", expired.join(", "));
                }
            }
        });
    }

    fn spawn_persistence_writer(&self) {
        let registry = self.registry.clone();
        let path = self.config.persist_path.clone();
        let interval_ms = self.config.persist_interval_ms;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(interval_ms));
            tick.tick().await;
            loop {
                tick.tick().await;
                persist_snapshot(&registry, &path).await;
            }
        });
    }
}

/// Evict members whose heartbeat went silent, then prune emptied rooms.
async fn sweep_dead_members(registry: &Arc<RoomRegistry>, timeout_ms: u64) {
    for (code, room) in registry.all_rooms().await {
        let mut guard = room.write().await;
        for device_id in guard.find_dead_clients(timeout_ms) {
            if let Some(info) = guard.remove_member(&device_id) {
                log::info!("Evicted silent member {} ({device_id}) from {code}", info.name);
                guard.broadcast(
                    &ServerFrame::new(ServerBody::MemberLeft {
                        code: code.clone(),
                        device_id,
                        name: info.name,
                    }),
                    None,
                );
            }
        }
    }
    let pruned = registry.prune_empty_rooms().await;
    if !pruned.is_empty() {
        log::debug!("Pruned empty rooms: {}", pruned.join(", "));
    }
}

/// Atomically rewrite the persistence snapshot (write-temp-then-rename).
async fn persist_snapshot(registry: &Arc<RoomRegistry>, path: &PathBuf) {
    let records = registry.to_persisted().await;
    let json = match serde_json::to_vec_pretty(&records) {
        Ok(json) => json,
        Err(e) => {
            log::warn!("Persistence snapshot failed to serialize: {e}");
            return;
        }
    };
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = tokio::fs::write(&tmp, &json).await {
        log::warn!("Persistence write to {} failed: {e}", tmp.display());
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        log::warn!("Persistence rename to {} failed: {e}", path.display());
    }
}

// ── Connection handling ─────────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<RoomRegistry>,
    webhooks: WebhookSender,
    config: RelayConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(MAX_FRAME_BYTES))
        .max_frame_size(Some(MAX_FRAME_BYTES));
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    log::debug!("Connection established from {peer}");

    // Writer task: drains the outbound queue so no room lock is ever held
    // across a socket write.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let mut session = Session::default();

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_text(
                    text.as_str(),
                    &mut session,
                    &out_tx,
                    &registry,
                    &webhooks,
                    &config,
                )
                .await;
            }
            Ok(Message::Binary(_)) => {
                reply_error(&out_tx, "Invalid message format", Some(ERR_INVALID_FRAME));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("Read error from {peer}: {e}");
                break;
            }
        }
    }

    // Transport gone: treat like a leave without a reply.
    handle_disconnect(&session, &registry, &webhooks).await;
    drop(out_tx);
    let _ = writer.await;
    log::debug!("Connection closed from {peer}");
    Ok(())
}

async fn handle_text(
    text: &str,
    session: &mut Session,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
    webhooks: &WebhookSender,
    config: &RelayConfig,
) {
    let frame = match decode_client(text) {
        Ok(frame) => frame,
        Err(ProtocolError::InvalidFrame) => {
            reply_error(out, "Invalid message format", Some(ERR_INVALID_FRAME));
            return;
        }
        Err(e) => {
            reply_error(out, e.to_string(), Some(ERR_INVALID_ARG));
            return;
        }
    };
    session.device_id = Some(frame.device_id.clone());
    dispatch(frame.device_id, frame.body, session, out, registry, webhooks, config).await;
}

#[allow(clippy::too_many_lines)]
async fn dispatch(
    device_id: String,
    body: ClientBody,
    session: &mut Session,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
    webhooks: &WebhookSender,
    config: &RelayConfig,
) {
    match body {
        ClientBody::CreateRoom {
            name,
            password,
            is_public,
            expires_in_hours,
            branch,
        } => {
            handle_create_room(
                &device_id, name, password, is_public, expires_in_hours, branch, session, out,
                registry, config,
            )
            .await;
        }
        ClientBody::JoinRoom {
            code,
            name,
            password,
            branch,
        } => {
            handle_join_room(
                &device_id, code, name, password, branch, session, out, registry, webhooks,
            )
            .await;
        }
        ClientBody::LeaveRoom { code } => {
            handle_leave(&device_id, &code, out, registry, webhooks, true).await;
            session.room_code = None;
        }
        ClientBody::Heartbeat { code, status, branch } => {
            handle_heartbeat(&device_id, &code, status, branch, out, registry).await;
        }
        ClientBody::FileChange { code, change } => {
            handle_file_change(&device_id, &code, change, out, registry, webhooks).await;
        }
        ClientBody::DeclareWorking { code, files } => {
            handle_declare_working(&device_id, &code, files, out, registry).await;
        }
        ClientBody::ChatMessage { code, content } => {
            handle_chat(&device_id, &code, content, out, registry, webhooks).await;
        }
        ClientBody::RequestStatus { code } | ClientBody::SyncRequest { code } => {
            if let Some(room) = room_or_error(registry, &code, out).await {
                let info = room.read().await.to_room_info();
                reply(out, ServerBody::RoomStatus { room: info });
            }
        }
        ClientBody::DeclareTyping { code, file } => {
            handle_typing(&device_id, &code, file, registry).await;
        }
        ClientBody::LockFile { code, file } => {
            handle_lock(&device_id, &code, &file, out, registry).await;
        }
        ClientBody::UnlockFile { code, file } => {
            handle_unlock(&device_id, &code, &file, out, registry).await;
        }
        ClientBody::UpdateCursor { code, cursor } => {
            handle_cursor(&device_id, &code, cursor, registry).await;
        }
        ClientBody::ShareTerminal { code, output } => {
            handle_terminal(&device_id, &code, output, out, registry).await;
        }
        ClientBody::ListRooms {} => {
            let rooms = registry.get_public_rooms().await;
            reply(out, ServerBody::RoomList { rooms });
        }
        ClientBody::GetTimeline { code, limit } => {
            if let Some(room) = room_or_error(registry, &code, out).await {
                let events = room.read().await.timeline_tail(limit.unwrap_or(50));
                reply(out, ServerBody::Timeline { code, events });
            }
        }
        ClientBody::SetWebhook { code, url, events } => {
            if let Some(room) = room_or_error(registry, &code, out).await {
                room.write().await.webhook = url.map(|url| WebhookConfig { url, events });
            }
        }
        ClientBody::SetRoomVisibility { code, is_public } => {
            if let Some(room) = room_or_error(registry, &code, out).await {
                room.write().await.is_public = is_public;
            }
        }
    }
}

// ── Handlers ────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn handle_create_room(
    device_id: &str,
    name: String,
    password: Option<String>,
    is_public: bool,
    expires_in_hours: u32,
    branch: Option<String>,
    session: &mut Session,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
    config: &RelayConfig,
) {
    if !valid_name(&name) {
        reply_error(out, "Name must be 1-50 characters", Some(ERR_INVALID_ARG));
        return;
    }
    let (code, room) = match registry
        .create_room(&name, password.clone(), is_public, expires_in_hours)
        .await
    {
        Ok(created) => created,
        Err(e) => {
            reply_error(out, e.to_string(), None);
            return;
        }
    };
    let info = {
        let mut guard = room.write().await;
        if let Err(reason) = guard.add_member(device_id, &name, out.clone(), branch) {
            reply_error(out, reason, None);
            return;
        }
        guard.to_room_info()
    };
    session.room_code = Some(code.clone());
    let link = invite_link(&config.host, config.port, &code, password.as_deref());
    log::info!("Room {code} created by {name}");
    reply(
        out,
        ServerBody::RoomCreated {
            room: info,
            invite_link: link,
        },
    );
}

#[allow(clippy::too_many_arguments)]
async fn handle_join_room(
    device_id: &str,
    code: String,
    name: String,
    password: Option<String>,
    branch: Option<String>,
    session: &mut Session,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
    webhooks: &WebhookSender,
) {
    if !valid_name(&name) {
        reply_error(out, "Name must be 1-50 characters", Some(ERR_INVALID_ARG));
        return;
    }
    let Some(room) = room_or_error(registry, &code, out).await else {
        return;
    };
    let webhook_cfg;
    {
        let mut guard = room.write().await;
        if !guard.check_password(password.as_deref()) {
            reply_error(out, "Wrong password", None);
            return;
        }
        if let Err(reason) = guard.add_member(device_id, &name, out.clone(), branch) {
            reply_error(out, reason, None);
            return;
        }
        session.room_code = Some(code.clone());

        // The joiner's own reply is enqueued before anyone hears about it.
        reply(
            out,
            ServerBody::RoomJoined {
                room: guard.to_room_info(),
            },
        );
        if let Some(member) = guard.member_info(device_id).cloned() {
            guard.broadcast(
                &ServerFrame::new(ServerBody::MemberJoined {
                    code: code.clone(),
                    member,
                }),
                Some(device_id),
            );
        }
        if let Some((message, branches)) = guard.check_branch_divergence() {
            guard.broadcast(
                &ServerFrame::new(ServerBody::BranchWarning {
                    code: code.clone(),
                    message,
                    branches,
                }),
                None,
            );
        }
        webhook_cfg = guard.webhook.clone();
    }
    log::info!("{name} joined {code}");
    if let Some(cfg) = webhook_cfg {
        webhooks.fire(
            &cfg,
            "join",
            &code,
            serde_json::json!({ "member": name, "deviceId": device_id }),
        );
    }
}

/// Shared by `leave_room` and transport disconnect; `announce` controls the
/// `room_left` reply.
async fn handle_leave(
    device_id: &str,
    code: &str,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
    webhooks: &WebhookSender,
    announce: bool,
) {
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let (info, now_empty, webhook_cfg) = {
        let mut guard = room.write().await;
        let info = guard.remove_member(device_id);
        if let Some(info) = &info {
            guard.broadcast(
                &ServerFrame::new(ServerBody::MemberLeft {
                    code: code.to_string(),
                    device_id: device_id.to_string(),
                    name: info.name.clone(),
                }),
                None,
            );
        }
        (info, guard.is_empty(), guard.webhook.clone())
    };
    let Some(info) = info else {
        return;
    };
    if announce {
        reply(
            out,
            ServerBody::RoomLeft {
                code: code.to_string(),
            },
        );
    }
    if now_empty {
        registry.delete_room(code).await;
        log::info!("Room {code} deleted (empty)");
    }
    if let Some(cfg) = webhook_cfg {
        webhooks.fire(
            &cfg,
            "leave",
            code,
            serde_json::json!({ "member": info.name, "deviceId": device_id }),
        );
    }
}

async fn handle_disconnect(
    session: &Session,
    registry: &Arc<RoomRegistry>,
    webhooks: &WebhookSender,
) {
    let (Some(device_id), Some(code)) = (&session.device_id, &session.room_code) else {
        return;
    };
    // The reply channel is gone; reuse the leave path without announcing.
    let (sink, _drain) = mpsc::unbounded_channel();
    handle_leave(device_id, code, &sink, registry, webhooks, false).await;
}

async fn handle_heartbeat(
    device_id: &str,
    code: &str,
    status: MemberStatus,
    branch: Option<String>,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
) {
    if let Some(room) = registry.get_room(code).await {
        let mut guard = room.write().await;
        let branch_changed = guard.update_heartbeat(device_id, status, branch);
        if branch_changed {
            if let Some((message, branches)) = guard.check_branch_divergence() {
                guard.broadcast(
                    &ServerFrame::new(ServerBody::BranchWarning {
                        code: code.to_string(),
                        message,
                        branches,
                    }),
                    None,
                );
            }
        }
        reply(out, ServerBody::HeartbeatAck {});
    }
}

async fn handle_file_change(
    device_id: &str,
    code: &str,
    change: FileChange,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
    webhooks: &WebhookSender,
) {
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let webhook_cfg;
    let conflict_authors: Vec<String>;
    let path = change.path.clone();
    {
        let mut guard = room.write().await;
        if let Some(lock) = guard.lock_held_by_other(device_id, &change.path) {
            let holder = lock.locked_by.clone();
            reply_error(
                out,
                format!("File {path} is locked by {holder}"),
                None,
            );
            return;
        }
        let author = change.author.clone();
        let conflicts = guard.record_file_change(change.clone());

        // Peers hear about the change before any conflict warning.
        guard.broadcast(
            &ServerFrame::new(ServerBody::FileChanged {
                code: code.to_string(),
                change: change.clone(),
            }),
            Some(device_id),
        );

        conflict_authors = if conflicts.is_empty() {
            Vec::new()
        } else {
            let others: Vec<String> = conflicts.iter().map(|m| m.name.clone()).collect();
            guard.record_conflict(&author, &path, &others);
            let mut authors = others;
            authors.push(author.clone());
            guard.broadcast(
                &ServerFrame::new(ServerBody::ConflictWarning {
                    code: code.to_string(),
                    file: path.clone(),
                    authors: authors.clone(),
                    message: format!("{} are both editing {path}", authors.join(" and ")),
                }),
                None,
            );
            authors
        };
        webhook_cfg = guard.webhook.clone();
    }
    if let Some(cfg) = webhook_cfg {
        webhooks.fire(
            &cfg,
            "file_change",
            code,
            serde_json::json!({
                "path": path,
                "changeType": change.kind,
                "author": change.author,
            }),
        );
        if !conflict_authors.is_empty() {
            webhooks.fire(
                &cfg,
                "conflict",
                code,
                serde_json::json!({ "file": path, "authors": conflict_authors }),
            );
        }
    }
}

async fn handle_declare_working(
    device_id: &str,
    code: &str,
    files: Vec<String>,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
) {
    if files.len() > MAX_WORKING_FILES {
        reply_error(
            out,
            format!("Too many files (max {MAX_WORKING_FILES})"),
            Some(ERR_INVALID_ARG),
        );
        return;
    }
    if files.iter().any(|f| f.chars().count() > MAX_PATH_LEN) {
        reply_error(
            out,
            format!("File path too long (max {MAX_PATH_LEN} characters)"),
            Some(ERR_INVALID_ARG),
        );
        return;
    }
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let mut guard = room.write().await;
    let conflicts = guard.update_working_files(device_id, files);
    let Some(member) = guard.member_info(device_id).cloned() else {
        return;
    };
    let name = member.name.clone();
    guard.broadcast(
        &ServerFrame::new(ServerBody::MemberUpdated {
            code: code.to_string(),
            member,
        }),
        None,
    );
    for (file, others) in conflicts {
        let other_names: Vec<String> = others.iter().map(|m| m.name.clone()).collect();
        guard.record_conflict(&name, &file, &other_names);
        let mut authors = other_names;
        authors.push(name.clone());
        guard.broadcast(
            &ServerFrame::new(ServerBody::ConflictWarning {
                code: code.to_string(),
                file: file.clone(),
                authors: authors.clone(),
                message: format!("{} are both editing {file}", authors.join(" and ")),
            }),
            None,
        );
    }
}

async fn handle_chat(
    device_id: &str,
    code: &str,
    content: String,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
    webhooks: &WebhookSender,
) {
    let len = content.chars().count();
    if len == 0 || len > MAX_CHAT_LEN {
        reply_error(
            out,
            format!("Message must be 1-{MAX_CHAT_LEN} characters"),
            Some(ERR_INVALID_ARG),
        );
        return;
    }
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let webhook_cfg;
    let author;
    {
        let mut guard = room.write().await;
        let Some(name) = guard.member_name(device_id) else {
            return;
        };
        author = name;
        guard.record_chat(&author, &content);
        guard.broadcast(
            &ServerFrame::new(ServerBody::ChatReceived {
                code: code.to_string(),
                device_id: device_id.to_string(),
                author: author.clone(),
                content: content.clone(),
            }),
            Some(device_id),
        );
        webhook_cfg = guard.webhook.clone();
    }
    if let Some(cfg) = webhook_cfg {
        webhooks.fire(
            &cfg,
            "chat",
            code,
            serde_json::json!({ "author": author, "content": content }),
        );
    }
}

async fn handle_typing(
    device_id: &str,
    code: &str,
    file: Option<String>,
    registry: &Arc<RoomRegistry>,
) {
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    set_typing(&room, device_id, file.clone()).await;
    let guard = room.read().await;
    let Some(name) = guard.member_name(device_id) else {
        return;
    };
    guard.broadcast(
        &ServerFrame::new(ServerBody::TypingIndicator {
            code: code.to_string(),
            device_id: device_id.to_string(),
            name,
            file,
        }),
        Some(device_id),
    );
}

async fn handle_lock(
    device_id: &str,
    code: &str,
    file: &str,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
) {
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let mut guard = room.write().await;
    let Some(name) = guard.member_name(device_id) else {
        return;
    };
    match guard.lock_file(device_id, &name, file) {
        LockOutcome::Acquired(lock) | LockOutcome::AlreadyHeld(lock) => {
            guard.broadcast(
                &ServerFrame::new(ServerBody::FileLocked {
                    code: code.to_string(),
                    lock,
                }),
                None,
            );
        }
        LockOutcome::Busy { locked_by } => {
            reply(
                out,
                ServerBody::LockError {
                    file: file.to_string(),
                    message: format!("File is locked by {locked_by}"),
                    locked_by: Some(locked_by),
                },
            );
        }
        LockOutcome::CapReached => {
            reply(
                out,
                ServerBody::LockError {
                    file: file.to_string(),
                    message: "Lock limit reached (max 50 locks per room)".to_string(),
                    locked_by: None,
                },
            );
        }
    }
}

async fn handle_unlock(
    device_id: &str,
    code: &str,
    file: &str,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
) {
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let mut guard = room.write().await;
    let Some(name) = guard.member_name(device_id) else {
        return;
    };
    match guard.unlock_file(device_id, &name, file) {
        UnlockOutcome::Released | UnlockOutcome::NotLocked => {
            guard.broadcast(
                &ServerFrame::new(ServerBody::FileUnlocked {
                    code: code.to_string(),
                    file: file.to_string(),
                    device_id: device_id.to_string(),
                    name,
                }),
                None,
            );
        }
        UnlockOutcome::NotOwner { locked_by } => {
            reply_error(out, format!("File is locked by {locked_by}"), None);
        }
    }
}

async fn handle_cursor(
    device_id: &str,
    code: &str,
    cursor: Option<CursorPos>,
    registry: &Arc<RoomRegistry>,
) {
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let mut guard = room.write().await;
    guard.update_cursor(device_id, cursor.clone());
    let Some(name) = guard.member_name(device_id) else {
        return;
    };
    guard.broadcast(
        &ServerFrame::new(ServerBody::CursorUpdated {
            code: code.to_string(),
            device_id: device_id.to_string(),
            name,
            cursor,
        }),
        Some(device_id),
    );
}

async fn handle_terminal(
    device_id: &str,
    code: &str,
    output: String,
    out: &FrameSender,
    registry: &Arc<RoomRegistry>,
) {
    if output.chars().count() > MAX_TERMINAL_OUTPUT {
        reply_error(
            out,
            format!("Terminal output too large (max {MAX_TERMINAL_OUTPUT} characters)"),
            Some(ERR_INVALID_ARG),
        );
        return;
    }
    let Some(room) = registry.get_room(code).await else {
        return;
    };
    let guard = room.read().await;
    let Some(name) = guard.member_name(device_id) else {
        return;
    };
    guard.broadcast(
        &ServerFrame::new(ServerBody::TerminalShared {
            code: code.to_string(),
            device_id: device_id.to_string(),
            name,
            output,
        }),
        Some(device_id),
    );
}

// ── Small helpers ───────────────────────────────────────────────────

fn valid_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_NAME_LEN).contains(&len)
}

fn reply(out: &FrameSender, body: ServerBody) {
    if let Ok(text) = encode_server(&ServerFrame {
        timestamp: now_ms(),
        body,
    }) {
        let _ = out.send(text);
    }
}

fn reply_error(out: &FrameSender, message: impl Into<String>, code: Option<&str>) {
    reply(
        out,
        ServerBody::Error {
            message: message.into(),
            code: code.map(str::to_string),
        },
    );
}

/// Fetch a room for the read-style handlers that owe the client an error.
async fn room_or_error(
    registry: &Arc<RoomRegistry>,
    code: &str,
    out: &FrameSender,
) -> Option<SharedRoom> {
    let room = registry.get_room(code).await;
    if room.is_none() {
        reply_error(out, "Room not found", None);
    }
    room
}
