//! Room records and the in-process registry that owns them.
//!
//! The registry is the single source of truth for membership, ownership and
//! the current drawer. Every mutation happens under one write lock and is
//! released before any broadcast or persistence work, so callers never hold
//! room state across an await.
//!
//! ```text
//!   create_room ──► Room { owner, participants: [owner], current_drawer: owner }
//!        │
//!        ├── add_participant ──► participants.push (idempotent)
//!        ├── set_owner ────────► only from "guest1"
//!        └── set_current_drawer ► previous drawer returned
//!                  │
//!                  ▼
//!            RoomStore (optional write-through)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::SessionError;
use crate::identity::{self, DEFAULT_OWNER};
use crate::storage::{RoomStore, StoreError};

pub type RoomId = String;
pub type ParticipantId = String;

/// Number of characters taken from a v4 UUID for a new room id.
pub const ROOM_ID_LEN: usize = 8;
/// Longest room id accepted on lookup.
pub const MAX_ROOM_ID_LEN: usize = 64;
/// Attempts at a fresh room id before giving up with a conflict.
const MAX_ID_ATTEMPTS: usize = 8;

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Short URL-safe room id: the first eight hex characters of a v4 UUID.
pub fn generate_room_id() -> RoomId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ROOM_ID_LEN);
    id
}

/// Reject ids that could never have been issued: empty, too long, or with
/// characters outside `[A-Za-z0-9_-]`.
pub fn validate_room_id(room_id: &str) -> Result<(), SessionError> {
    if room_id.is_empty() {
        return Err(SessionError::validation("room id must not be empty"));
    }
    if room_id.len() > MAX_ROOM_ID_LEN || !room_id.bytes().all(identity::is_name_byte) {
        return Err(SessionError::validation(format!("malformed room id '{room_id}'")));
    }
    Ok(())
}

/// One whiteboard room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub owner_id: ParticipantId,
    /// Insertion-ordered, no duplicates.
    pub participants: Vec<ParticipantId>,
    /// `None` only before the first assignment; otherwise a member.
    pub current_drawer: Option<ParticipantId>,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl Room {
    /// New room whose owner is the sole participant and the initial drawer.
    pub fn new(id: impl Into<RoomId>, owner: impl Into<ParticipantId>) -> Self {
        let owner = owner.into();
        let now = now_secs();
        Self {
            id: id.into(),
            owner_id: owner.clone(),
            participants: vec![owner.clone()],
            current_drawer: Some(owner),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_member(&self, identity: &str) -> bool {
        self.participants.iter().any(|p| p == identity)
    }

    pub fn is_owner(&self, identity: &str) -> bool {
        self.owner_id == identity
    }

    pub fn is_drawer(&self, identity: &str) -> bool {
        self.current_drawer.as_deref() == Some(identity)
    }

    /// Append `identity` unless already present. Returns whether it was added.
    fn admit(&mut self, identity: &str) -> bool {
        if self.is_member(identity) {
            return false;
        }
        self.participants.push(identity.to_string());
        true
    }

    /// Make `identity` the drawer, admitting it first if needed.
    /// Returns the previous drawer.
    pub(crate) fn assign_drawer(&mut self, identity: &str) -> Option<ParticipantId> {
        self.admit(identity);
        self.current_drawer.replace(identity.to_string())
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
    }

    pub fn participant_views(&self) -> Vec<Participant> {
        self.participants
            .iter()
            .map(|id| Participant {
                id: id.clone(),
                is_drawer: self.is_drawer(id),
                is_owner: self.is_owner(id),
            })
            .collect()
    }

    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            participants: self.participants.clone(),
            current_drawer: self.current_drawer.clone(),
            owner_id: self.owner_id.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (room, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(room)
    }
}

/// A member as seen against the room's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub is_drawer: bool,
    pub is_owner: bool,
}

/// Room state as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub participants: Vec<ParticipantId>,
    pub current_drawer: Option<ParticipantId>,
    pub owner_id: ParticipantId,
}

/// Result of admitting an identity to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub participant_id: ParticipantId,
    /// False when the identity was already a member.
    pub newly_added: bool,
}

/// In-memory room registry with optional write-through to a [`RoomStore`].
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Room>>,
    store: Option<Arc<dyn RoomStore>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_store(store: Arc<dyn RoomStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Load every persisted room record. Existing in-memory rooms win.
    pub async fn recover(&self) -> Result<usize, SessionError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let persisted = store.load_rooms()?;
        let mut rooms = self.rooms.write().await;
        let mut recovered = 0;
        for room in persisted {
            if !rooms.contains_key(&room.id) {
                rooms.insert(room.id.clone(), room);
                recovered += 1;
            }
        }

        log::info!("Recovered {recovered} rooms from storage");
        Ok(recovered)
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Create a room owned by `owner_id`, who is also the first drawer.
    pub async fn create_room(&self, owner_id: &str) -> Result<RoomId, SessionError> {
        self.create_room_with(owner_id, generate_room_id).await
    }

    async fn create_room_with<F>(&self, owner_id: &str, mut next_id: F) -> Result<RoomId, SessionError>
    where
        F: FnMut() -> RoomId,
    {
        if owner_id.is_empty() {
            return Err(SessionError::validation("owner id must not be empty"));
        }

        let mut rooms = self.rooms.write().await;
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = next_id();
            if rooms.contains_key(&id) {
                log::debug!("Room id {id} already taken, retrying");
                continue;
            }
            let room = Room::new(id.clone(), owner_id);
            self.write_through(&room);
            rooms.insert(id.clone(), room);
            log::info!("Room {id} created by {owner_id}");
            return Ok(id);
        }

        Err(SessionError::Conflict(MAX_ID_ATTEMPTS))
    }

    /// Add `identity` to the room, or allocate a guest id when absent.
    /// Existing members are returned unchanged.
    pub async fn add_participant(
        &self,
        room_id: &str,
        requested: Option<&str>,
    ) -> Result<Admission, SessionError> {
        self.modify(room_id, |room| {
            let participant_id = match identity::non_blank(requested) {
                Some(id) => id.to_string(),
                None => identity::next_guest_id(&room.participants),
            };
            let newly_added = room.admit(&participant_id);
            Ok((
                Admission {
                    participant_id,
                    newly_added,
                },
                newly_added,
            ))
        })
        .await
    }

    /// Transfer ownership away from the default owner. Any other current
    /// owner makes this a no-op returning `false`.
    pub async fn set_owner(&self, room_id: &str, new_owner: &str) -> Result<bool, SessionError> {
        if new_owner.is_empty() {
            return Err(SessionError::validation("new owner must not be empty"));
        }
        self.modify(room_id, |room| {
            if room.owner_id != DEFAULT_OWNER {
                return Ok((false, false));
            }
            room.owner_id = new_owner.to_string();
            room.admit(new_owner);
            Ok((true, true))
        })
        .await
    }

    /// Unconditionally set the drawer. Returns the previous one.
    pub async fn set_current_drawer(
        &self,
        room_id: &str,
        identity: &str,
    ) -> Result<Option<ParticipantId>, SessionError> {
        if identity.is_empty() {
            return Err(SessionError::validation("drawer identity must not be empty"));
        }
        self.modify(room_id, |room| Ok((room.assign_drawer(identity), true)))
            .await
    }

    /// Run `f` against one room under the registry write lock.
    ///
    /// `f` returns its value plus whether it changed the room; changed rooms
    /// get `updated_at` bumped and are written through to the store.
    pub(crate) async fn modify<T, F>(&self, room_id: &str, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&mut Room) -> Result<(T, bool), SessionError>,
    {
        validate_room_id(room_id)?;
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))?;

        let (value, changed) = f(room)?;
        if changed {
            room.touch();
            self.write_through(room);
        }
        Ok(value)
    }

    fn write_through(&self, room: &Room) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_room(room) {
                log::warn!("Failed to persist room {}: {e}", room.id);
            }
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub async fn get_room(&self, room_id: &str) -> Result<Room, SessionError> {
        validate_room_id(room_id)?;
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn session_info(&self, room_id: &str) -> Result<SessionInfo, SessionError> {
        Ok(self.get_room(room_id).await?.session_info())
    }

    pub async fn participant_views(&self, room_id: &str) -> Result<Vec<Participant>, SessionError> {
        Ok(self.get_room(room_id).await?.participant_views())
    }

    pub async fn current_drawer(&self, room_id: &str) -> Result<Option<ParticipantId>, SessionError> {
        Ok(self.get_room(room_id).await?.current_drawer)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of rooms owned by `owner`, oldest first.
    pub async fn rooms_owned_by(&self, owner: &str) -> Vec<RoomId> {
        let rooms = self.rooms.read().await;
        let mut owned: Vec<&Room> = rooms.values().filter(|r| r.owner_id == owner).collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        owned.into_iter().map(|r| r.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_generate_room_id() {
        let id = generate_room_id();
        assert_eq!(id.len(), ROOM_ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(validate_room_id(&id).is_ok());
    }

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("a1b2c3d4").is_ok());
        assert!(validate_room_id("my-room_2").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("../etc").is_err());
        assert!(validate_room_id(&"a".repeat(MAX_ROOM_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_room_encode_decode() {
        let room = Room::new("abcd1234", "alice");
        let bytes = room.encode().unwrap();
        assert_eq!(Room::decode(&bytes).unwrap(), room);
    }

    #[tokio::test]
    async fn test_create_room() {
        let registry = RoomRegistry::new();
        let id = registry.create_room("alice").await.unwrap();
        let room = registry.get_room(&id).await.unwrap();

        assert_eq!(room.owner_id, "alice");
        assert_eq!(room.participants, vec!["alice".to_string()]);
        assert_eq!(room.current_drawer.as_deref(), Some("alice"));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_room_retries_collision() {
        let registry = RoomRegistry::new();
        registry
            .create_room_with("alice", || "fixed001".to_string())
            .await
            .unwrap();

        let mut ids = vec!["fixed001".to_string(), "fixed002".to_string()].into_iter();
        let id = registry
            .create_room_with("bob", move || ids.next().unwrap_or_default())
            .await
            .unwrap();
        assert_eq!(id, "fixed002");
    }

    #[tokio::test]
    async fn test_create_room_conflict_exhausted() {
        let registry = RoomRegistry::new();
        registry
            .create_room_with("alice", || "fixed001".to_string())
            .await
            .unwrap();

        let err = registry
            .create_room_with("bob", || "fixed001".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Conflict(MAX_ID_ATTEMPTS)));
    }

    #[tokio::test]
    async fn test_get_room_not_found() {
        let registry = RoomRegistry::new();
        let err = registry.get_room("nope1234").await.unwrap_err();
        assert!(matches!(err, SessionError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_add_participant_idempotent() {
        let registry = RoomRegistry::new();
        let id = registry.create_room("alice").await.unwrap();

        let first = registry.add_participant(&id, Some("bob")).await.unwrap();
        assert!(first.newly_added);
        let again = registry.add_participant(&id, Some("bob")).await.unwrap();
        assert!(!again.newly_added);
        assert_eq!(again.participant_id, "bob");

        let room = registry.get_room(&id).await.unwrap();
        assert_eq!(room.participants, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_add_participant_allocates_guest() {
        let registry = RoomRegistry::new();
        let id = registry.create_room(DEFAULT_OWNER).await.unwrap();

        let a = registry.add_participant(&id, None).await.unwrap();
        let b = registry.add_participant(&id, Some("  ")).await.unwrap();
        assert_eq!(a.participant_id, "guest2");
        assert_eq!(b.participant_id, "guest3");
    }

    #[tokio::test]
    async fn test_add_participant_missing_room() {
        let registry = RoomRegistry::new();
        let err = registry.add_participant("missing1", Some("bob")).await.unwrap_err();
        assert!(matches!(err, SessionError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_set_owner_only_from_default() {
        let registry = RoomRegistry::new();
        let id = registry.create_room(DEFAULT_OWNER).await.unwrap();

        assert!(registry.set_owner(&id, "user-42").await.unwrap());
        let room = registry.get_room(&id).await.unwrap();
        assert_eq!(room.owner_id, "user-42");
        assert!(room.is_member("user-42"));

        assert!(!registry.set_owner(&id, "user-99").await.unwrap());
        assert_eq!(registry.get_room(&id).await.unwrap().owner_id, "user-42");
    }

    #[tokio::test]
    async fn test_set_current_drawer_keeps_membership_invariant() {
        let registry = RoomRegistry::new();
        let id = registry.create_room("alice").await.unwrap();

        let previous = registry.set_current_drawer(&id, "carol").await.unwrap();
        assert_eq!(previous.as_deref(), Some("alice"));

        let room = registry.get_room(&id).await.unwrap();
        assert!(room.is_drawer("carol"));
        assert!(room.is_member("carol"));
    }

    #[tokio::test]
    async fn test_participant_views() {
        let registry = RoomRegistry::new();
        let id = registry.create_room("alice").await.unwrap();
        registry.add_participant(&id, Some("bob")).await.unwrap();
        registry.set_current_drawer(&id, "bob").await.unwrap();

        let views = registry.participant_views(&id).await.unwrap();
        assert_eq!(
            views,
            vec![
                Participant { id: "alice".into(), is_drawer: false, is_owner: true },
                Participant { id: "bob".into(), is_drawer: true, is_owner: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_rooms_owned_by() {
        let registry = RoomRegistry::new();
        let a = registry.create_room("alice").await.unwrap();
        let _ = registry.create_room("bob").await.unwrap();
        let owned = registry.rooms_owned_by("alice").await;
        assert_eq!(owned, vec![a]);
    }

    #[tokio::test]
    async fn test_write_through_and_recover() {
        let store = Arc::new(MemoryStore::new());
        let id = {
            let registry = RoomRegistry::with_store(store.clone());
            let id = registry.create_room("alice").await.unwrap();
            registry.add_participant(&id, Some("bob")).await.unwrap();
            id
        };

        let restarted = RoomRegistry::with_store(store);
        assert_eq!(restarted.recover().await.unwrap(), 1);
        let room = restarted.get_room(&id).await.unwrap();
        assert_eq!(room.participants, vec!["alice".to_string(), "bob".to_string()]);
    }
}
