//! Room state: members, advisory locks, timeline, recent changes.
//!
//! A room is logically single-writer — the relay wraps each room in an
//! `Arc<RwLock<Room>>` and every mutating operation runs under the write
//! lock. Outbound frames go through per-connection unbounded channels so no
//! lock is ever held across socket I/O; `broadcast` encodes once and skips
//! closed transports silently.
//!
//! ```text
//! handler ──► RwLock<Room> ──► member.tx (mpsc) ──► writer task ──► socket
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::ids::now_ms;
use crate::protocol::{
    encode_server, ChangeKind, CursorPos, FileChange, LockRecord, MemberInfo, MemberStatus,
    RoomInfo, RoomSummary, ServerFrame, TimelineEvent, TimelineKind, MAX_LOCKS_PER_ROOM,
    MAX_RECENT_CHANGES, MAX_ROOM_MEMBERS, MAX_TIMELINE_EVENTS, TYPING_TIMEOUT_MS,
};
use crate::webhook::WebhookConfig;

/// Outbound frame channel for one member's connection.
///
/// Carries pre-encoded JSON; the connection's writer task turns each entry
/// into a text frame. A closed receiver means the transport is gone and the
/// send is silently skipped.
pub type FrameSender = UnboundedSender<String>;

/// A room shared between the registry and connection handlers.
pub type SharedRoom = Arc<RwLock<Room>>;

/// One seated member: peer-visible info plus the outbound transport handle.
struct Member {
    info: MemberInfo,
    tx: FrameSender,
}

/// Snapshot projections live in `protocol`; `Room` owns the mutable state.
pub struct Room {
    pub code: String,
    pub created_at: u64,
    pub created_by: String,
    /// In-memory plaintext password, known for rooms created this run.
    password: Option<String>,
    /// SHA-256 hex of the password, the only form ever persisted. Rooms
    /// recovered from disk carry the hash alone.
    password_hash: Option<String>,
    pub is_public: bool,
    /// 0 = never expires.
    pub expires_in_hours: u32,
    pub last_activity: u64,
    members: HashMap<String, Member>,
    locks: HashMap<String, LockRecord>,
    recent_changes: VecDeque<FileChange>,
    timeline: VecDeque<TimelineEvent>,
    next_event_id: u64,
    typing_timers: HashMap<String, JoinHandle<()>>,
    pub webhook: Option<WebhookConfig>,
}

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// Fresh acquisition; a `lock` timeline event was appended.
    Acquired(LockRecord),
    /// The caller already holds the lock; no state change.
    AlreadyHeld(LockRecord),
    /// Someone else holds it.
    Busy { locked_by: String },
    /// The room is at `MAX_LOCKS_PER_ROOM`.
    CapReached,
}

/// Result of an unlock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UnlockOutcome {
    Released,
    /// The file was not locked; unlock is idempotent, no state change.
    NotLocked,
    NotOwner { locked_by: String },
}

impl Room {
    pub fn new(
        code: String,
        created_by: String,
        password: Option<String>,
        is_public: bool,
        expires_in_hours: u32,
    ) -> Self {
        let now = now_ms();
        Self {
            code,
            created_at: now,
            created_by,
            password,
            password_hash: None,
            is_public,
            expires_in_hours,
            last_activity: now,
            members: HashMap::new(),
            locks: HashMap::new(),
            recent_changes: VecDeque::new(),
            timeline: VecDeque::new(),
            next_event_id: 1,
            typing_timers: HashMap::new(),
            webhook: None,
        }
    }

    /// Re-create a room from persisted metadata. Membership is always cold
    /// and only the password hash survives.
    pub fn from_persisted(
        code: String,
        created_at: u64,
        created_by: String,
        password_hash: Option<String>,
        is_public: bool,
        expires_in_hours: u32,
        last_activity: u64,
    ) -> Self {
        let mut room = Self::new(code, created_by, None, is_public, expires_in_hours);
        room.created_at = created_at;
        room.last_activity = last_activity;
        room.password_hash = password_hash;
        room
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some() || self.password_hash.is_some()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// SHA-256 hex of the password, for the persistence snapshot.
    pub fn password_hash(&self) -> Option<String> {
        self.password
            .as_deref()
            .map(sha256_hex)
            .or_else(|| self.password_hash.clone())
    }

    /// Check a presented password. Rooms recovered from disk compare
    /// against the stored hash; live rooms compare plaintext.
    pub fn check_password(&self, presented: Option<&str>) -> bool {
        if let Some(expected) = &self.password {
            return presented == Some(expected.as_str());
        }
        if let Some(hash) = &self.password_hash {
            return presented.map(sha256_hex).as_deref() == Some(hash.as_str());
        }
        true
    }

    fn touch(&mut self) {
        self.last_activity = now_ms();
    }

    fn push_event(&mut self, kind: TimelineKind, actor: &str, detail: String) {
        let event = TimelineEvent {
            id: self.next_event_id,
            ts: now_ms(),
            kind,
            actor: actor.to_string(),
            detail,
        };
        self.next_event_id += 1;
        self.timeline.push_back(event);
        while self.timeline.len() > MAX_TIMELINE_EVENTS {
            self.timeline.pop_front();
        }
    }

    // ── Membership ──────────────────────────────────────────────────

    /// Seat a member. Returns a human-readable reason on failure.
    pub fn add_member(
        &mut self,
        device_id: &str,
        name: &str,
        tx: FrameSender,
        branch: Option<String>,
    ) -> Result<(), String> {
        if self.members.len() >= MAX_ROOM_MEMBERS {
            return Err(format!("Room is full (max {MAX_ROOM_MEMBERS} members)"));
        }
        if self.members.contains_key(device_id) {
            return Err("Device is already connected to this room".to_string());
        }
        let now = now_ms();
        let info = MemberInfo {
            device_id: device_id.to_string(),
            name: name.to_string(),
            status: MemberStatus::Active,
            working_on: Vec::new(),
            joined_at: now,
            last_seen: now,
            branch,
            typing_in: None,
            cursor: None,
        };
        self.members.insert(device_id.to_string(), Member {
            info,
            tx,
        });
        self.touch();
        self.push_event(TimelineKind::Join, name, "joined the room".to_string());
        Ok(())
    }

    /// Unseat a member: cancel its typing timer, release every lock it
    /// holds, remove the seat, then record the departure.
    pub fn remove_member(&mut self, device_id: &str) -> Option<MemberInfo> {
        if let Some(timer) = self.typing_timers.remove(device_id) {
            timer.abort();
        }
        self.locks.retain(|_, lock| lock.device_id != device_id);
        let member = self.members.remove(device_id)?;
        self.touch();
        self.push_event(
            TimelineKind::Leave,
            &member.info.name,
            "left the room".to_string(),
        );
        Some(member.info)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member_info(&self, device_id: &str) -> Option<&MemberInfo> {
        self.members.get(device_id).map(|m| &m.info)
    }

    pub fn member_name(&self, device_id: &str) -> Option<String> {
        self.members.get(device_id).map(|m| m.info.name.clone())
    }

    // ── Liveness / presence ─────────────────────────────────────────

    /// Refresh `last_seen` and status; returns true when the branch changed
    /// (a `branch_change` event is then on the timeline).
    pub fn update_heartbeat(
        &mut self,
        device_id: &str,
        status: MemberStatus,
        branch: Option<String>,
    ) -> bool {
        let Some(member) = self.members.get_mut(device_id) else {
            return false;
        };
        member.info.last_seen = now_ms();
        member.info.status = status;
        if let Some(new_branch) = branch {
            if member.info.branch.as_deref() != Some(new_branch.as_str()) {
                let name = member.info.name.clone();
                member.info.branch = Some(new_branch.clone());
                self.touch();
                self.push_event(
                    TimelineKind::BranchChange,
                    &name,
                    format!("switched to branch '{new_branch}'"),
                );
                return true;
            }
        }
        false
    }

    /// Device ids whose `last_seen` is older than `timeout_ms`.
    pub fn find_dead_clients(&self, timeout_ms: u64) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(timeout_ms);
        self.members
            .values()
            .filter(|m| m.info.last_seen < cutoff)
            .map(|m| m.info.device_id.clone())
            .collect()
    }

    /// Last-writer-wins cursor update. No broadcast from here.
    pub fn update_cursor(&mut self, device_id: &str, cursor: Option<CursorPos>) {
        if let Some(member) = self.members.get_mut(device_id) {
            member.info.cursor = cursor;
        }
    }

    // ── Locks ───────────────────────────────────────────────────────

    pub fn lock_file(&mut self, device_id: &str, name: &str, file: &str) -> LockOutcome {
        if let Some(existing) = self.locks.get(file) {
            if existing.device_id == device_id {
                return LockOutcome::AlreadyHeld(existing.clone());
            }
            return LockOutcome::Busy {
                locked_by: existing.locked_by.clone(),
            };
        }
        if self.locks.len() >= MAX_LOCKS_PER_ROOM {
            return LockOutcome::CapReached;
        }
        let lock = LockRecord {
            file: file.to_string(),
            locked_by: name.to_string(),
            device_id: device_id.to_string(),
            locked_at: now_ms(),
        };
        self.locks.insert(file.to_string(), lock.clone());
        self.touch();
        self.push_event(TimelineKind::Lock, name, format!("locked {file}"));
        LockOutcome::Acquired(lock)
    }

    pub fn unlock_file(&mut self, device_id: &str, name: &str, file: &str) -> UnlockOutcome {
        match self.locks.get(file) {
            None => UnlockOutcome::NotLocked,
            Some(lock) if lock.device_id != device_id => UnlockOutcome::NotOwner {
                locked_by: lock.locked_by.clone(),
            },
            Some(_) => {
                self.locks.remove(file);
                self.touch();
                self.push_event(TimelineKind::Unlock, name, format!("unlocked {file}"));
                UnlockOutcome::Released
            }
        }
    }

    /// The lock on `file` held by a device other than `device_id`, if any.
    pub fn lock_held_by_other(&self, device_id: &str, file: &str) -> Option<&LockRecord> {
        self.locks
            .get(file)
            .filter(|lock| lock.device_id != device_id)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    // ── Content events ──────────────────────────────────────────────

    /// Record a file change and return the conflict set: the *other*
    /// members whose declared working set includes the changed path.
    pub fn record_file_change(&mut self, change: FileChange) -> Vec<MemberInfo> {
        let detail = match change.kind {
            ChangeKind::Add => format!("added {}", change.path),
            ChangeKind::Change => format!("changed {}", change.path),
            ChangeKind::Unlink => format!("deleted {}", change.path),
        };
        self.push_event(TimelineKind::FileChange, &change.author, detail);
        let conflicts: Vec<MemberInfo> = self
            .members
            .values()
            .filter(|m| {
                m.info.device_id != change.device_id
                    && m.info.working_on.iter().any(|f| f == &change.path)
            })
            .map(|m| m.info.clone())
            .collect();
        self.recent_changes.push_back(change);
        while self.recent_changes.len() > MAX_RECENT_CHANGES {
            self.recent_changes.pop_front();
        }
        self.touch();
        conflicts
    }

    /// Append a chat line to the timeline.
    pub fn record_chat(&mut self, author: &str, content: &str) {
        self.push_event(TimelineKind::Chat, author, content.to_string());
        self.touch();
    }

    /// Note an editing conflict on the timeline.
    pub fn record_conflict(&mut self, actor: &str, file: &str, others: &[String]) {
        self.push_event(
            TimelineKind::Conflict,
            actor,
            format!("conflict on {file} with {}", others.join(", ")),
        );
    }

    /// Replace a member's declared working set. Returns, for each file,
    /// the other members currently declaring it (empty entries omitted).
    pub fn update_working_files(
        &mut self,
        device_id: &str,
        files: Vec<String>,
    ) -> Vec<(String, Vec<MemberInfo>)> {
        {
            let Some(member) = self.members.get_mut(device_id) else {
                return Vec::new();
            };
            member.info.working_on = files.clone();
            member.info.last_seen = now_ms();
        }
        self.touch();
        files
            .into_iter()
            .filter_map(|file| {
                let others: Vec<MemberInfo> = self
                    .members
                    .values()
                    .filter(|m| {
                        m.info.device_id != device_id
                            && m.info.working_on.iter().any(|f| f == &file)
                    })
                    .map(|m| m.info.clone())
                    .collect();
                if others.is_empty() {
                    None
                } else {
                    Some((file, others))
                }
            })
            .collect()
    }

    /// Diverged when more than one distinct branch is declared. Returns a
    /// message plus the `{name → branch}` mapping.
    pub fn check_branch_divergence(&self) -> Option<(String, HashMap<String, String>)> {
        let branches: HashMap<String, String> = self
            .members
            .values()
            .filter_map(|m| {
                m.info
                    .branch
                    .clone()
                    .map(|b| (m.info.name.clone(), b))
            })
            .collect();
        let mut distinct: Vec<&String> = branches.values().collect();
        distinct.sort();
        distinct.dedup();
        if distinct.len() <= 1 {
            return None;
        }
        let mut parts: Vec<String> = branches
            .iter()
            .map(|(name, branch)| format!("{name} on '{branch}'"))
            .collect();
        parts.sort();
        let message = format!("Branch divergence detected: {}", parts.join(", "));
        Some((message, branches))
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn to_room_info(&self) -> RoomInfo {
        let tail = |len: usize| len.saturating_sub(20);
        RoomInfo {
            code: self.code.clone(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            has_password: self.has_password(),
            is_public: self.is_public,
            expires_in_hours: self.expires_in_hours,
            last_activity: self.last_activity,
            members: self.members.values().map(|m| m.info.clone()).collect(),
            locks: self.locks.values().cloned().collect(),
            recent_changes: self
                .recent_changes
                .iter()
                .skip(tail(self.recent_changes.len()))
                .cloned()
                .collect(),
            timeline: self
                .timeline
                .iter()
                .skip(tail(self.timeline.len()))
                .cloned()
                .collect(),
        }
    }

    pub fn to_room_summary(&self) -> RoomSummary {
        RoomSummary {
            code: self.code.clone(),
            created_by: self.created_by.clone(),
            member_count: self.members.len(),
            member_names: self.members.values().map(|m| m.info.name.clone()).collect(),
            has_password: self.has_password(),
            is_public: self.is_public,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    /// The last `limit` timeline events, oldest first.
    pub fn timeline_tail(&self, limit: usize) -> Vec<TimelineEvent> {
        self.timeline
            .iter()
            .skip(self.timeline.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    pub fn recent_changes(&self) -> impl Iterator<Item = &FileChange> {
        self.recent_changes.iter()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_in_hours > 0
            && now.saturating_sub(self.last_activity)
                > u64::from(self.expires_in_hours) * 3_600_000
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Send one frame to one member; closed transports are skipped.
    pub fn send_to(&self, device_id: &str, frame: &ServerFrame) {
        let Ok(text) = encode_server(frame) else {
            return;
        };
        if let Some(member) = self.members.get(device_id) {
            let _ = member.tx.send(text);
        }
    }

    /// Best-effort fan-out to every member except `exclude`.
    pub fn broadcast(&self, frame: &ServerFrame, exclude: Option<&str>) {
        let Ok(text) = encode_server(frame) else {
            return;
        };
        for member in self.members.values() {
            if Some(member.info.device_id.as_str()) == exclude {
                continue;
            }
            let _ = member.tx.send(text.clone());
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        for timer in self.typing_timers.values() {
            timer.abort();
        }
    }
}

/// Set or clear a member's typing indicator.
///
/// A fresh `Some(file)` replaces any outstanding auto-clear timer with a new
/// 10 s one that clears the field only if it still equals `file`; `None`
/// cancels the timer. The timer holds a weak handle so it never keeps a
/// deleted room alive. The auto-clear is deliberately not broadcast — peers
/// age out stale indicators on their own.
pub async fn set_typing(room: &SharedRoom, device_id: &str, file: Option<String>) {
    let mut guard = room.write().await;
    if !guard.members.contains_key(device_id) {
        return;
    }
    if let Some(timer) = guard.typing_timers.remove(device_id) {
        timer.abort();
    }
    if let Some(member) = guard.members.get_mut(device_id) {
        member.info.typing_in = file.clone();
    }
    let Some(file) = file else {
        return;
    };
    let weak: Weak<RwLock<Room>> = Arc::downgrade(room);
    let device = device_id.to_string();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(TYPING_TIMEOUT_MS)).await;
        let Some(room) = weak.upgrade() else {
            return;
        };
        let mut guard = room.write().await;
        if let Some(member) = guard.members.get_mut(&device) {
            if member.info.typing_in.as_deref() == Some(file.as_str()) {
                member.info.typing_in = None;
            }
        }
        guard.typing_timers.remove(&device);
    });
    guard.typing_timers.insert(device_id.to_string(), handle);
}

fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
