//! Room registry: the room-code → room map and its persistence snapshot.
//!
//! The registry's own lock is a short critical section for create, lookup
//! and delete; per-room mutation happens under each room's write lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::ids::{generate_room_code, now_ms};
use crate::protocol::RoomSummary;
use crate::room::{Room, SharedRoom};

/// How many collision retries before giving up on a fresh code.
const CODE_RETRIES: usize = 50;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Could not allocate a unique room code")]
    CodeSpaceExhausted,
}

/// One persisted room record. Passwords are stored only as SHA-256 hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRoom {
    pub code: String,
    pub created_at: u64,
    pub created_by: String,
    pub has_password: bool,
    pub password_hash: Option<String>,
    pub is_public: bool,
    pub expires_in_hours: u32,
    pub last_activity: u64,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, SharedRoom>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room under a freshly generated code.
    pub async fn create_room(
        &self,
        created_by: &str,
        password: Option<String>,
        is_public: bool,
        expires_in_hours: u32,
    ) -> Result<(String, SharedRoom), RegistryError> {
        let mut rooms = self.rooms.write().await;
        let code = (0..CODE_RETRIES)
            .map(|_| generate_room_code())
            .find(|c| !rooms.contains_key(c))
            .ok_or(RegistryError::CodeSpaceExhausted)?;
        let room = Arc::new(RwLock::new(Room::new(
            code.clone(),
            created_by.to_string(),
            password,
            is_public,
            expires_in_hours,
        )));
        rooms.insert(code.clone(), room.clone());
        Ok((code, room))
    }

    pub async fn get_room(&self, code: &str) -> Option<SharedRoom> {
        self.rooms.read().await.get(code).cloned()
    }

    pub async fn has_room(&self, code: &str) -> bool {
        self.rooms.read().await.contains_key(code)
    }

    pub async fn delete_room(&self, code: &str) -> bool {
        self.rooms.write().await.remove(code).is_some()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Snapshot of every room, for the periodic sweeps.
    pub async fn all_rooms(&self) -> Vec<(String, SharedRoom)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(c, r)| (c.clone(), r.clone()))
            .collect()
    }

    /// Summaries of discoverable rooms: public and currently occupied.
    pub async fn get_public_rooms(&self) -> Vec<RoomSummary> {
        let rooms: Vec<SharedRoom> = self.rooms.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for room in rooms {
            let guard = room.read().await;
            if guard.is_public && !guard.is_empty() {
                out.push(guard.to_room_summary());
            }
        }
        out
    }

    /// Drop rooms with no seated members. Returns the codes removed.
    pub async fn prune_empty_rooms(&self) -> Vec<String> {
        let snapshot: Vec<(String, SharedRoom)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(c, r)| (c.clone(), r.clone()))
            .collect();
        let mut doomed = Vec::new();
        for (code, room) in snapshot {
            if room.read().await.is_empty() {
                doomed.push(code);
            }
        }
        if !doomed.is_empty() {
            let mut rooms = self.rooms.write().await;
            for code in &doomed {
                rooms.remove(code);
            }
        }
        doomed
    }

    /// Drop rooms whose `last_activity` is past their expiry window.
    pub async fn prune_expired_rooms(&self) -> Vec<String> {
        let now = now_ms();
        let snapshot: Vec<(String, SharedRoom)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(c, r)| (c.clone(), r.clone()))
            .collect();
        let mut doomed = Vec::new();
        for (code, room) in snapshot {
            if room.read().await.is_expired(now) {
                doomed.push(code);
            }
        }
        if !doomed.is_empty() {
            let mut rooms = self.rooms.write().await;
            for code in &doomed {
                rooms.remove(code);
            }
        }
        doomed
    }

    /// Snapshot every occupied room for the persistence file.
    pub async fn to_persisted(&self) -> Vec<PersistedRoom> {
        let rooms: Vec<SharedRoom> = self.rooms.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for room in rooms {
            let guard = room.read().await;
            if guard.is_empty() {
                continue;
            }
            out.push(PersistedRoom {
                code: guard.code.clone(),
                created_at: guard.created_at,
                created_by: guard.created_by.clone(),
                has_password: guard.has_password(),
                password_hash: guard.password_hash(),
                is_public: guard.is_public,
                expires_in_hours: guard.expires_in_hours,
                last_activity: guard.last_activity,
            });
        }
        out
    }

    /// Re-create rooms from a persistence snapshot. Membership is cold;
    /// codes already present are left untouched.
    pub async fn load_persisted(&self, records: Vec<PersistedRoom>) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut loaded = 0;
        for rec in records {
            if rooms.contains_key(&rec.code) {
                continue;
            }
            let room = Room::from_persisted(
                rec.code.clone(),
                rec.created_at,
                rec.created_by,
                rec.password_hash.filter(|_| rec.has_password),
                rec.is_public,
                rec.expires_in_hours,
                rec.last_activity,
            );
            rooms.insert(rec.code, Arc::new(RwLock::new(room)));
            loaded += 1;
        }
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::is_valid_room_code;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = RoomRegistry::new();
        let (code, room) = registry
            .create_room("Zeus", None, false, 0)
            .await
            .unwrap();
        assert!(is_valid_room_code(&code));
        assert!(registry.has_room(&code).await);
        assert!(Arc::ptr_eq(&registry.get_room(&code).await.unwrap(), &room));
        assert!(registry.get_room("HIVE-ZZZZZZ").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_room() {
        let registry = RoomRegistry::new();
        let (code, _room) = registry
            .create_room("Zeus", None, false, 0)
            .await
            .unwrap();
        assert!(registry.delete_room(&code).await);
        assert!(!registry.delete_room(&code).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_public_rooms_excludes_empty_and_private() {
        let registry = RoomRegistry::new();
        let (_pub_empty, _) = registry
            .create_room("Zeus", None, true, 0)
            .await
            .unwrap();
        let (pub_code, pub_room) = registry
            .create_room("Alice", None, true, 0)
            .await
            .unwrap();
        let (_priv_code, priv_room) = registry
            .create_room("Bob", None, false, 0)
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        pub_room
            .write()
            .await
            .add_member("dev-1", "Alice", tx, None)
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        priv_room
            .write()
            .await
            .add_member("dev-2", "Bob", tx, None)
            .unwrap();

        let listed = registry.get_public_rooms().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].code, pub_code);
    }

    #[tokio::test]
    async fn test_prune_empty_rooms() {
        let registry = RoomRegistry::new();
        let (_empty, _) = registry.create_room("Zeus", None, false, 0).await.unwrap();
        let (kept_code, kept) = registry.create_room("Alice", None, false, 0).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        kept.write()
            .await
            .add_member("dev-1", "Alice", tx, None)
            .unwrap();

        let pruned = registry.prune_empty_rooms().await;
        assert_eq!(pruned.len(), 1);
        assert_eq!(registry.room_count().await, 1);
        assert!(registry.has_room(&kept_code).await);
    }

    #[tokio::test]
    async fn test_prune_expired_rooms() {
        let registry = RoomRegistry::new();
        let (stale_code, stale) = registry
            .create_room("Zeus", None, false, 1)
            .await
            .unwrap();
        let (fresh_code, _) = registry
            .create_room("Alice", None, false, 1)
            .await
            .unwrap();
        stale.write().await.last_activity = now_ms() - 2 * 3_600_000;

        let pruned = registry.prune_expired_rooms().await;
        assert_eq!(pruned, vec![stale_code]);
        assert!(registry.has_room(&fresh_code).await);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip_hashes_password() {
        let registry = RoomRegistry::new();
        let (code, room) = registry
            .create_room("Zeus", Some("secret123".into()), true, 24)
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        room.write()
            .await
            .add_member("dev-1", "Zeus", tx, None)
            .unwrap();

        let snapshot = registry.to_persisted().await;
        assert_eq!(snapshot.len(), 1);
        let rec = &snapshot[0];
        assert_eq!(rec.code, code);
        assert!(rec.has_password);
        let hash = rec.password_hash.clone().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("secret123"));

        // Reload into a fresh registry; the recovered room checks hashes.
        let restored = RoomRegistry::new();
        assert_eq!(restored.load_persisted(snapshot).await, 1);
        let recovered = restored.get_room(&code).await.unwrap();
        let guard = recovered.read().await;
        assert!(guard.is_empty());
        assert!(guard.check_password(Some("secret123")));
        assert!(!guard.check_password(Some("wrong")));
    }

    #[tokio::test]
    async fn test_persisted_skips_empty_rooms() {
        let registry = RoomRegistry::new();
        registry.create_room("Zeus", None, true, 0).await.unwrap();
        assert!(registry.to_persisted().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_persisted_does_not_clobber_live_rooms() {
        let registry = RoomRegistry::new();
        let (code, _room) = registry.create_room("Zeus", None, false, 0).await.unwrap();
        let loaded = registry
            .load_persisted(vec![PersistedRoom {
                code: code.clone(),
                created_at: 1,
                created_by: "Ghost".into(),
                has_password: false,
                password_hash: None,
                is_public: false,
                expires_in_hours: 0,
                last_activity: 1,
            }])
            .await;
        assert_eq!(loaded, 0);
        let room = registry.get_room(&code).await.unwrap();
        assert_eq!(room.read().await.created_by, "Zeus");
    }
}
