//! Agent client: the developer-side connection to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - A heartbeat loop that runs only while a room is joined
//! - Auto-rejoin with the remembered password and branch on reconnection
//! - An offline ring of file changes, flushed in order once rejoined
//! - One-shot waiters so callers can await a specific reply with a timeout
//!
//! ```text
//! watcher ──► report_file_change ──┬── connected ──► relay
//!                                  └── offline ───► queue (ring of 50)
//! relay ──► reader task ──► waiters ──► event channel ──► embedding layer
//! ```

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::ids::generate_device_id;
use crate::protocol::{
    decode_server, encode_client, ClientBody, ClientFrame, CursorPos, FileChange, MemberStatus,
    RoomInfo, RoomSummary, ServerBody, ServerFrame, TimelineEvent, DEFAULT_HOST, DEFAULT_PORT,
    HEARTBEAT_INTERVAL_MS, MAX_QUEUED_CHANGES,
};

/// How long to wait for `room_created` / `room_joined`.
const WAIT_ROOM_MS: u64 = 10_000;
/// How long to wait for status, timeline, list and lock replies.
const WAIT_QUERY_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Agent configuration; the reconnect knobs exist for tests.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    /// Display name announced to the room.
    pub name: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            name: "anonymous".to_string(),
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl AgentConfig {
    /// Read `RELAY_HOST` / `RELAY_PORT` / `DEV_NAME` from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("RELAY_HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        if let Ok(port) = std::env::var("RELAY_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(name) = std::env::var("DEV_NAME") {
            if !name.is_empty() {
                config.name = name;
            }
        }
        config
    }
}

/// Events surfaced to the embedding layer (editor bridge, chat bridge, …).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    ReconnectGaveUp,
    /// Every decoded server frame, after waiter dispatch.
    Frame(ServerFrame),
}

/// Session state remembered across reconnects.
#[derive(Default)]
struct AgentState {
    current_room: Option<String>,
    current_password: Option<String>,
    current_branch: Option<String>,
    current_status: MemberStatus,
    queue: VecDeque<FileChange>,
    last_status: Option<RoomInfo>,
}

/// A one-shot listener: fires at most once, then is removed.
struct Waiter {
    id: u64,
    predicate: Box<dyn Fn(&ServerFrame) -> bool + Send + Sync>,
    tx: Option<oneshot::Sender<ServerFrame>>,
}

pub struct AgentClient {
    name: String,
    device_id: String,
    url: String,
    config: AgentConfig,
    state: Mutex<AgentState>,
    waiters: Mutex<Vec<Waiter>>,
    next_waiter_id: std::sync::atomic::AtomicU64,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    should_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: config.name.clone(),
            device_id: generate_device_id(),
            url: format!("ws://{}:{}", config.host, config.port),
            config,
            state: Mutex::new(AgentState::default()),
            waiters: Mutex::new(Vec::new()),
            next_waiter_id: std::sync::atomic::AtomicU64::new(1),
            outgoing: Mutex::new(None),
            connected: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            heartbeat: Mutex::new(None),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn current_room(&self) -> Option<String> {
        self.state.lock().await.current_room.clone()
    }

    pub async fn queued_changes(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Take the event receiver (once).
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AgentEvent>> {
        self.event_rx.lock().await.take()
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Open the transport, start the reader/writer tasks and the heartbeat
    /// loop. If a room is remembered (reconnection), rejoin it and flush
    /// the offline queue on success.
    pub fn connect<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), AgentError>> + Send + 'a>>
    {
        Box::pin(async move {
            if self.is_connected() {
                return Ok(());
            }
            let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| AgentError::Connect(e.to_string()))?;
            let (mut ws_tx, mut ws_rx) = ws.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
            *self.outgoing.lock().await = Some(out_tx);
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.event_tx.send(AgentEvent::Connected);
            log::info!("Connected to {}", self.url);

            // Writer task.
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    let is_close = matches!(msg, Message::Close(_));
                    if ws_tx.send(msg).await.is_err() || is_close {
                        break;
                    }
                }
            });

            // Reader task.
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_rx.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match decode_server(text.as_str()) {
                            Ok(frame) => this.dispatch_frame(frame).await,
                            Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                this.on_connection_lost().await;
            });

            self.ensure_heartbeat().await;

            // A connection opening while a room is remembered is a reconnect.
            let rejoin_code = self.state.lock().await.current_room.clone();
            if let Some(code) = rejoin_code {
                let this = self.clone();
                tokio::spawn(async move {
                    this.rejoin(code).await;
                });
            }
            Ok(())
        })
    }

    /// Clean shutdown: leave the room, close with 1000, stop reconnecting.
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
        let in_room = self.state.lock().await.current_room.clone();
        if let Some(code) = in_room {
            self.send_body(ClientBody::LeaveRoom { code }).await;
        }
        if let Some(tx) = self.outgoing.lock().await.take() {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "Client disconnect".into(),
            })));
        }
        self.connected.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.current_room = None;
        state.current_password = None;
        state.queue.clear();
        log::info!("Disconnected");
    }

    async fn on_connection_lost(self: &Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        *self.outgoing.lock().await = None;
        let _ = self.event_tx.send(AgentEvent::Disconnected);
        if !self.should_reconnect.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return; // a reconnect loop is already running
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Exponential backoff: min(base·2^attempt, max), up to the attempt cap.
    async fn reconnect_loop(self: &Arc<Self>) {
        for attempt in 0..self.config.max_reconnect_attempts {
            if !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            let delay = self
                .config
                .reconnect_base_ms
                .saturating_mul(1u64 << attempt.min(31))
                .min(self.config.reconnect_max_ms);
            let _ = self.event_tx.send(AgentEvent::Reconnecting {
                attempt: attempt + 1,
            });
            log::info!(
                "Reconnect attempt {}/{} in {delay}ms",
                attempt + 1,
                self.config.max_reconnect_attempts
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if self.connect().await.is_ok() {
                return;
            }
        }
        log::warn!("Giving up after {} reconnect attempts", self.config.max_reconnect_attempts);
        let _ = self.event_tx.send(AgentEvent::ReconnectGaveUp);
    }

    async fn rejoin(self: &Arc<Self>, code: String) {
        let (password, branch) = {
            let state = self.state.lock().await;
            (state.current_password.clone(), state.current_branch.clone())
        };
        log::info!("Rejoining {code}");
        self.send_body(ClientBody::JoinRoom {
            code: code.clone(),
            name: self.name.clone(),
            password,
            branch,
        })
        .await;
        let reply = self
            .wait_for(
                |f| matches!(f.body, ServerBody::RoomJoined { .. } | ServerBody::Error { .. }),
                Duration::from_millis(WAIT_ROOM_MS),
            )
            .await;
        match reply {
            Some(ServerFrame {
                body: ServerBody::RoomJoined { .. },
                ..
            }) => {
                self.flush_queue().await;
            }
            Some(ServerFrame {
                body: ServerBody::Error { message, .. },
                ..
            }) => {
                let dropped = {
                    let mut state = self.state.lock().await;
                    state.current_room = None;
                    std::mem::take(&mut state.queue).len()
                };
                log::warn!("Rejoin of {code} refused ({message}); discarded {dropped} queued changes");
            }
            _ => log::warn!("Rejoin of {code} timed out; queue kept for the next attempt"),
        }
    }

    /// Send every queued change in original order.
    async fn flush_queue(self: &Arc<Self>) {
        let (code, queued) = {
            let mut state = self.state.lock().await;
            let Some(code) = state.current_room.clone() else {
                return;
            };
            (code, std::mem::take(&mut state.queue))
        };
        if queued.is_empty() {
            return;
        }
        log::info!("Flushing {} queued file changes", queued.len());
        for change in queued {
            self.send_body(ClientBody::FileChange {
                code: code.clone(),
                change,
            })
            .await;
        }
    }

    async fn ensure_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().await;
        if slot.is_some() {
            return;
        }
        let this = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(this.config.heartbeat_interval_ms));
            tick.tick().await;
            loop {
                tick.tick().await;
                if !this.is_connected() {
                    continue;
                }
                let body = {
                    let state = this.state.lock().await;
                    state.current_room.clone().map(|code| ClientBody::Heartbeat {
                        code,
                        status: state.current_status,
                        branch: state.current_branch.clone(),
                    })
                };
                if let Some(body) = body {
                    this.send_body(body).await;
                }
            }
        }));
    }

    // ── Frame plumbing ──────────────────────────────────────────────

    async fn dispatch_frame(&self, frame: ServerFrame) {
        if let ServerBody::RoomStatus { room } = &frame.body {
            self.state.lock().await.last_status = Some(room.clone());
        }

        // Fire every matching one-shot waiter exactly once.
        {
            let mut waiters = self.waiters.lock().await;
            for waiter in waiters.iter_mut() {
                if (waiter.predicate)(&frame) {
                    if let Some(tx) = waiter.tx.take() {
                        let _ = tx.send(frame.clone());
                    }
                }
            }
            waiters.retain(|w| w.tx.is_some());
        }

        let _ = self.event_tx.send(AgentEvent::Frame(frame));
    }

    /// Register a one-shot listener and await it with a timeout.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&ServerFrame) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> Option<ServerFrame> {
        let id = self
            .next_waiter_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push(Waiter {
            id,
            predicate: Box::new(predicate),
            tx: Some(tx),
        });
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Some(frame),
            _ => {
                // Timed out or sender dropped: the waiter is a dead entry now.
                self.waiters.lock().await.retain(|w| w.id != id);
                None
            }
        }
    }

    async fn send_body(&self, body: ClientBody) -> bool {
        let Some(tx) = self.outgoing.lock().await.clone() else {
            return false;
        };
        let frame = ClientFrame::new(self.device_id.clone(), body);
        match encode_client(&frame) {
            Ok(text) => tx.send(Message::Text(text.into())).is_ok(),
            Err(e) => {
                log::warn!("Failed to encode frame: {e}");
                false
            }
        }
    }

    /// Send a room-scoped body; silent no-op when not in a room.
    async fn send_in_room(&self, make: impl FnOnce(String) -> ClientBody) -> bool {
        let code = self.state.lock().await.current_room.clone();
        match code {
            Some(code) => self.send_body(make(code)).await,
            None => false,
        }
    }

    // ── Room operations ─────────────────────────────────────────────

    /// Create a room and wait up to 10 s for the reply.
    pub async fn create_room(
        &self,
        password: Option<String>,
        is_public: bool,
        expires_in_hours: u32,
    ) -> Option<(RoomInfo, String)> {
        let branch = self.state.lock().await.current_branch.clone();
        self.send_body(ClientBody::CreateRoom {
            name: self.name.clone(),
            password: password.clone(),
            is_public,
            expires_in_hours,
            branch,
        })
        .await;
        let reply = self
            .wait_for(
                |f| matches!(f.body, ServerBody::RoomCreated { .. }),
                Duration::from_millis(WAIT_ROOM_MS),
            )
            .await?;
        let ServerBody::RoomCreated { room, invite_link } = reply.body else {
            return None;
        };
        let mut state = self.state.lock().await;
        state.current_room = Some(room.code.clone());
        state.current_password = password;
        Some((room, invite_link))
    }

    /// Join a room and wait up to 10 s; `Err` carries the relay's message.
    pub async fn join_room(
        &self,
        code: &str,
        password: Option<String>,
    ) -> Result<RoomInfo, String> {
        let branch = self.state.lock().await.current_branch.clone();
        self.send_body(ClientBody::JoinRoom {
            code: code.to_string(),
            name: self.name.clone(),
            password: password.clone(),
            branch,
        })
        .await;
        let reply = self
            .wait_for(
                |f| matches!(f.body, ServerBody::RoomJoined { .. } | ServerBody::Error { .. }),
                Duration::from_millis(WAIT_ROOM_MS),
            )
            .await
            .ok_or_else(|| "join timed out".to_string())?;
        match reply.body {
            ServerBody::RoomJoined { room } => {
                let mut state = self.state.lock().await;
                state.current_room = Some(room.code.clone());
                state.current_password = password;
                Ok(room)
            }
            ServerBody::Error { message, .. } => Err(message),
            _ => Err("unexpected reply".to_string()),
        }
    }

    pub async fn leave_room(&self) {
        let code = {
            let mut state = self.state.lock().await;
            let code = state.current_room.take();
            state.current_password = None;
            state.queue.clear();
            code
        };
        if let Some(code) = code {
            self.send_body(ClientBody::LeaveRoom { code }).await;
        }
    }

    /// Remember the local git branch; sent with heartbeats and joins.
    pub async fn set_branch(&self, branch: Option<String>) {
        self.state.lock().await.current_branch = branch;
    }

    pub async fn set_status(&self, status: MemberStatus) {
        self.state.lock().await.current_status = status;
    }

    /// Report a watcher change. Queued (ring of 50, oldest dropped) while
    /// the transport is down but a room is still remembered.
    pub async fn report_file_change(&self, change: FileChange) {
        let mut state = self.state.lock().await;
        let Some(code) = state.current_room.clone() else {
            return;
        };
        if self.is_connected() {
            drop(state);
            self.send_body(ClientBody::FileChange { code, change }).await;
        } else {
            if state.queue.len() >= MAX_QUEUED_CHANGES {
                state.queue.pop_front();
            }
            state.queue.push_back(change);
        }
    }

    pub async fn send_chat(&self, content: &str) {
        let content = content.to_string();
        self.send_in_room(|code| ClientBody::ChatMessage { code, content })
            .await;
    }

    pub async fn declare_working(&self, files: Vec<String>) {
        self.send_in_room(|code| ClientBody::DeclareWorking { code, files })
            .await;
    }

    pub async fn declare_typing(&self, file: Option<String>) {
        self.send_in_room(|code| ClientBody::DeclareTyping { code, file })
            .await;
    }

    pub async fn update_cursor(&self, cursor: Option<CursorPos>) {
        self.send_in_room(|code| ClientBody::UpdateCursor { code, cursor })
            .await;
    }

    pub async fn share_terminal(&self, output: &str) {
        let output = output.to_string();
        self.send_in_room(|code| ClientBody::ShareTerminal { code, output })
            .await;
    }

    /// Lock a file and wait up to 5 s for `file_locked` or `lock_error`.
    pub async fn lock_file(&self, file: &str) -> Option<ServerFrame> {
        let target = file.to_string();
        if !self
            .send_in_room(|code| ClientBody::LockFile {
                code,
                file: target.clone(),
            })
            .await
        {
            return None;
        }
        let file = file.to_string();
        self.wait_for(
            move |f| match &f.body {
                ServerBody::FileLocked { lock, .. } => lock.file == file,
                ServerBody::LockError { file: errored, .. } => *errored == file,
                _ => false,
            },
            Duration::from_millis(WAIT_QUERY_MS),
        )
        .await
    }

    pub async fn unlock_file(&self, file: &str) {
        let file = file.to_string();
        self.send_in_room(|code| ClientBody::UnlockFile { code, file })
            .await;
    }

    /// List public rooms; `None` on timeout.
    pub async fn list_rooms(&self) -> Option<Vec<RoomSummary>> {
        self.send_body(ClientBody::ListRooms {}).await;
        let reply = self
            .wait_for(
                |f| matches!(f.body, ServerBody::RoomList { .. }),
                Duration::from_millis(WAIT_QUERY_MS),
            )
            .await?;
        match reply.body {
            ServerBody::RoomList { rooms } => Some(rooms),
            _ => None,
        }
    }

    /// Fetch the room timeline; `None` on timeout.
    pub async fn get_timeline(&self, limit: Option<usize>) -> Option<Vec<TimelineEvent>> {
        if !self
            .send_in_room(|code| ClientBody::GetTimeline { code, limit })
            .await
        {
            return None;
        }
        let reply = self
            .wait_for(
                |f| matches!(f.body, ServerBody::Timeline { .. }),
                Duration::from_millis(WAIT_QUERY_MS),
            )
            .await?;
        match reply.body {
            ServerBody::Timeline { events, .. } => Some(events),
            _ => None,
        }
    }

    /// Request a status snapshot; falls back to the last cached one on
    /// timeout.
    pub async fn request_status(&self) -> Option<RoomInfo> {
        if !self
            .send_in_room(|code| ClientBody::RequestStatus { code })
            .await
        {
            return self.state.lock().await.last_status.clone();
        }
        let reply = self
            .wait_for(
                |f| matches!(f.body, ServerBody::RoomStatus { .. }),
                Duration::from_millis(WAIT_QUERY_MS),
            )
            .await;
        match reply {
            Some(ServerFrame {
                body: ServerBody::RoomStatus { room },
                ..
            }) => Some(room),
            _ => self.state.lock().await.last_status.clone(),
        }
    }

    pub async fn set_webhook(&self, url: Option<String>, events: Vec<String>) {
        self.send_in_room(|code| ClientBody::SetWebhook { code, url, events })
            .await;
    }

    pub async fn set_room_visibility(&self, is_public: bool) {
        self.send_in_room(|code| ClientBody::SetRoomVisibility { code, is_public })
            .await;
    }
}
