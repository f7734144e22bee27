//! JSON envelope protocol between agents and the relay.
//!
//! Every frame on the wire is a single JSON object with a required string
//! `type` and a `timestamp` in epoch milliseconds; client→server frames also
//! carry the sender's `deviceId`. The closed type sets are modelled as
//! internally-tagged serde enums so that `decode(encode(m)) == m` holds for
//! every envelope:
//!
//! ```text
//! {"type":"chat_message","deviceId":"…","timestamp":1719423600000,
//!  "code":"HIVE-K7QMX4","content":"ship it"}
//! ```
//!
//! Unknown fields are ignored on decode. A frame that is not a JSON object,
//! or lacks a string `type`, is answered with an in-band `error` frame and
//! the connection stays open; the 4000-series close codes below are defined
//! for completeness but the relay prefers in-band errors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::ids::now_ms;

// ── Wire and room limits ────────────────────────────────────────────

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4819;
/// Maximum inbound frame size accepted by the relay.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub const MAX_ROOM_MEMBERS: usize = 20;
pub const MAX_LOCKS_PER_ROOM: usize = 50;
pub const MAX_RECENT_CHANGES: usize = 100;
pub const MAX_TIMELINE_EVENTS: usize = 200;
pub const TYPING_TIMEOUT_MS: u64 = 10_000;
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 45_000;
pub const ROOM_EXPIRY_CHECK_MS: u64 = 300_000;
pub const PERSIST_INTERVAL_MS: u64 = 60_000;
pub const MAX_QUEUED_CHANGES: usize = 50;

pub const MAX_NAME_LEN: usize = 50;
pub const MAX_CHAT_LEN: usize = 10_000;
pub const MAX_WORKING_FILES: usize = 100;
pub const MAX_PATH_LEN: usize = 500;
pub const MAX_TERMINAL_OUTPUT: usize = 50_000;

// Transport close codes. Defined but optional; in-band `error` frames are
// preferred so a single bad frame never tears down the connection.
pub const CLOSE_ROOM_CLOSED: u16 = 4000;
pub const CLOSE_INVALID_MESSAGE: u16 = 4001;
pub const CLOSE_ROOM_NOT_FOUND: u16 = 4002;
pub const CLOSE_DUPLICATE_DEVICE: u16 = 4003;

/// Machine-readable error codes carried in `error` frames.
pub const ERR_INVALID_FRAME: &str = "INVALID_FRAME";
pub const ERR_INVALID_ARG: &str = "INVALID_ARG";

// ── Shared payload records ──────────────────────────────────────────

/// Presence status of a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    #[default]
    Active,
    Idle,
    Away,
}

/// Cursor location within a file; the end fields describe a selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPos {
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
}

/// A member as seen by peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub device_id: String,
    pub name: String,
    #[serde(default)]
    pub status: MemberStatus,
    #[serde(default)]
    pub working_on: Vec<String>,
    pub joined_at: u64,
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPos>,
}

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
}

/// One observed file change, as reported by an agent's watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub author: String,
    pub device_id: String,
    pub timestamp: u64,
    /// Unified-style excerpt for text files; `None` for binaries.
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_before: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_after: Option<u64>,
}

/// An advisory file lock held by one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub file: String,
    /// Display name of the holder.
    pub locked_by: String,
    pub device_id: String,
    pub locked_at: u64,
}

/// Kinds of significant room events kept in the timeline ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Join,
    Leave,
    Chat,
    FileChange,
    Lock,
    Unlock,
    Conflict,
    BranchChange,
}

/// One timeline entry; `id` is strictly monotone per room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: u64,
    pub ts: u64,
    #[serde(rename = "type")]
    pub kind: TimelineKind,
    pub actor: String,
    pub detail: String,
}

/// Full room snapshot sent on join and on status requests.
///
/// `recent_changes` and `timeline` are truncated to the last 20 entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub code: String,
    pub created_at: u64,
    pub created_by: String,
    pub has_password: bool,
    pub is_public: bool,
    pub expires_in_hours: u32,
    pub last_activity: u64,
    pub members: Vec<MemberInfo>,
    pub locks: Vec<LockRecord>,
    pub recent_changes: Vec<FileChange>,
    pub timeline: Vec<TimelineEvent>,
}

/// Compact projection for the public room list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: String,
    pub created_by: String,
    pub member_count: usize,
    pub member_names: Vec<String>,
    pub has_password: bool,
    pub is_public: bool,
    pub created_at: u64,
    pub last_activity: u64,
}

// ── Client → server envelopes ───────────────────────────────────────

/// Envelope for every client→server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: ClientBody,
}

impl ClientFrame {
    pub fn new(device_id: impl Into<String>, body: ClientBody) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: now_ms(),
            body,
        }
    }
}

/// The closed set of client→server message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientBody {
    CreateRoom {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default)]
        is_public: bool,
        #[serde(default)]
        expires_in_hours: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    JoinRoom {
        code: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    LeaveRoom {
        code: String,
    },
    Heartbeat {
        code: String,
        #[serde(default)]
        status: MemberStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    FileChange {
        code: String,
        change: FileChange,
    },
    DeclareWorking {
        code: String,
        files: Vec<String>,
    },
    ChatMessage {
        code: String,
        content: String,
    },
    RequestStatus {
        code: String,
    },
    SyncRequest {
        code: String,
    },
    DeclareTyping {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
    LockFile {
        code: String,
        file: String,
    },
    UnlockFile {
        code: String,
        file: String,
    },
    UpdateCursor {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<CursorPos>,
    },
    ShareTerminal {
        code: String,
        output: String,
    },
    ListRooms {},
    GetTimeline {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    SetWebhook {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default)]
        events: Vec<String>,
    },
    SetRoomVisibility {
        code: String,
        is_public: bool,
    },
}

// ── Server → client envelopes ───────────────────────────────────────

/// Envelope for every server→client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: ServerBody,
}

impl ServerFrame {
    pub fn new(body: ServerBody) -> Self {
        Self {
            timestamp: now_ms(),
            body,
        }
    }
}

/// The closed set of server→client message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerBody {
    RoomCreated {
        room: RoomInfo,
        invite_link: String,
    },
    RoomJoined {
        room: RoomInfo,
    },
    RoomLeft {
        code: String,
    },
    MemberJoined {
        code: String,
        member: MemberInfo,
    },
    MemberLeft {
        code: String,
        device_id: String,
        name: String,
    },
    MemberUpdated {
        code: String,
        member: MemberInfo,
    },
    FileChanged {
        code: String,
        change: FileChange,
    },
    ChatReceived {
        code: String,
        device_id: String,
        author: String,
        content: String,
    },
    RoomStatus {
        room: RoomInfo,
    },
    ConflictWarning {
        code: String,
        file: String,
        authors: Vec<String>,
        message: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    HeartbeatAck {},
    TypingIndicator {
        code: String,
        device_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
    FileLocked {
        code: String,
        lock: LockRecord,
    },
    FileUnlocked {
        code: String,
        file: String,
        device_id: String,
        name: String,
    },
    LockError {
        file: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locked_by: Option<String>,
    },
    CursorUpdated {
        code: String,
        device_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<CursorPos>,
    },
    TerminalShared {
        code: String,
        device_id: String,
        name: String,
        output: String,
    },
    RoomList {
        rooms: Vec<RoomSummary>,
    },
    Timeline {
        code: String,
        events: Vec<TimelineEvent>,
    },
    BranchWarning {
        code: String,
        message: String,
        branches: HashMap<String, String>,
    },
}

// ── Codec ───────────────────────────────────────────────────────────

/// Errors surfaced by the envelope codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed JSON, not an object, or no string `type`.
    #[error("Invalid message format")]
    InvalidFrame,
    /// Well-formed frame with an unknown type or a bad payload shape.
    #[error("{0}")]
    InvalidArg(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Decode a client frame.
///
/// The first gate only checks "JSON object with a string `type`"; shape
/// validation of the payload happens in the same pass via serde but is
/// reported as [`ProtocolError::InvalidArg`] so the relay can answer with a
/// handler-level error instead of the generic invalid-format one.
pub fn decode_client(text: &str) -> Result<ClientFrame, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFrame)?;
    let has_type = value
        .as_object()
        .and_then(|o| o.get("type"))
        .map(|t| t.is_string())
        .unwrap_or(false);
    if !has_type {
        return Err(ProtocolError::InvalidFrame);
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidArg(e.to_string()))
}

/// Decode a server frame (agent side).
pub fn decode_server(text: &str) -> Result<ServerFrame, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::InvalidArg(e.to_string()))
}

pub fn encode_client(frame: &ClientFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn encode_server(frame: &ServerFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

// ── Invite links ────────────────────────────────────────────────────

/// Build a `codehive://` invite link for a room.
///
/// The password, when present, rides as a percent-encoded query parameter.
pub fn invite_link(host: &str, port: u16, code: &str, password: Option<&str>) -> String {
    match password {
        Some(pw) if !pw.is_empty() => {
            format!("codehive://{host}:{port}/join/{code}?password={}", url_encode(pw))
        }
        _ => format!("codehive://{host}:{port}/join/{code}"),
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
