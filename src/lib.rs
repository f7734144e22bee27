//! # codehive — real-time collaboration substrate for shared source trees
//!
//! Each developer runs a local agent that watches a project directory and
//! keeps one WebSocket to a shared relay. The relay groups agents into
//! rooms, forwards file changes, chat, typing/cursor hints and terminal
//! shares, and enforces the coordination primitives: per-file advisory
//! locks, conflict detection and branch-divergence warnings.
//!
//! ```text
//! ┌─────────────┐   file events   ┌─────────────┐    JSON frames    ┌─────────────┐
//! │ FileWatcher │ ──────────────► │ AgentClient │ ◄───────────────► │ RelayServer │
//! │ (per repo)  │                 │ (per dev)   │     WebSocket     │ (central)   │
//! └─────────────┘                 └─────────────┘                   └──────┬──────┘
//!                                                                          │
//!                                                         ┌────────────────┼──────────┐
//!                                                         ▼                ▼          ▼
//!                                                   RoomRegistry    WebhookSender  persistence
//!                                                   (code → Room)   (HTTP POST)    (60 s JSON)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — typed JSON envelopes, wire constants, invite links
//! - [`ids`] — room-code / device-id generation, time helpers
//! - [`room`] — members, locks, timeline, recent changes, conflict checks
//! - [`registry`] — room-code → room map, pruning, persistence snapshot
//! - [`server`] — the relay: dispatch, sweeps, persistence writer
//! - [`webhook`] — event-filtered HTTP fan-out
//! - [`client`] — agent connection: reconnect, heartbeat, offline queue
//! - [`watcher`] — recursive watch, per-path debounce, line diffs

pub mod client;
pub mod ids;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod watcher;
pub mod webhook;

pub use client::{AgentClient, AgentConfig, AgentError, AgentEvent};
pub use ids::{generate_device_id, generate_room_code, is_valid_room_code, now_ms};
pub use protocol::{
    ChangeKind, ClientBody, ClientFrame, CursorPos, FileChange, LockRecord, MemberInfo,
    MemberStatus, ProtocolError, RoomInfo, RoomSummary, ServerBody, ServerFrame, TimelineEvent,
    TimelineKind,
};
pub use registry::{PersistedRoom, RegistryError, RoomRegistry};
pub use room::{LockOutcome, Room, SharedRoom, UnlockOutcome};
pub use server::{RelayConfig, RelayServer};
pub use watcher::{FileWatcher, WatcherConfig, WatcherError};
pub use webhook::{WebhookConfig, WebhookSender};
