//! Snapshot types and the store contracts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::{now_secs, Room, RoomId};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Serialized drawing surface. `data` is opaque (typically a PNG data URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl CanvasSnapshot {
    pub fn new(data: impl Into<Vec<u8>>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            updated_at: now_secs(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Who caused a snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOrigin<'a> {
    /// Explicit save by an identity; it becomes the saver.
    Explicit(&'a str),
    /// Draw-path save by the current drawer; the saver is left alone.
    Drawing(&'a str),
}

/// Metadata kept next to a room's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub room_id: RoomId,
    /// Identity of the last explicit save, `None` while only drawing wrote it.
    pub saved_by: Option<String>,
    /// Drawer behind the last draw-path save.
    pub last_drawn_by: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Uncompressed snapshot size in bytes
    pub size: u64,
    /// Stored size in bytes (equal to `size` when uncompressed)
    pub compressed_size: u64,
    /// Seconds since epoch, preserved across overwrites
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl SnapshotRecord {
    /// Record for a save of `snapshot`, carrying `created_at` and whichever
    /// identity `origin` does not replace over from the previous record.
    pub(crate) fn upsert(
        previous: Option<&SnapshotRecord>,
        room_id: &str,
        snapshot: &CanvasSnapshot,
        origin: SaveOrigin<'_>,
        compressed_size: u64,
    ) -> Self {
        let now = now_secs();
        let (saved_by, last_drawn_by) = match origin {
            SaveOrigin::Explicit(who) => (
                Some(who.to_string()),
                previous.and_then(|p| p.last_drawn_by.clone()),
            ),
            SaveOrigin::Drawing(who) => (
                previous.and_then(|p| p.saved_by.clone()),
                Some(who.to_string()),
            ),
        };
        Self {
            room_id: room_id.to_string(),
            saved_by,
            last_drawn_by,
            width: snapshot.width,
            height: snapshot.height,
            size: snapshot.data.len() as u64,
            compressed_size,
            created_at: previous.map_or(now, |p| p.created_at),
            updated_at: now,
        }
    }

    pub fn is_saved_by(&self, identity: &str) -> bool {
        self.saved_by.as_deref() == Some(identity)
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Newest first; ties broken by room id so listings are stable.
pub(crate) fn sort_newest_first(records: &mut [SnapshotRecord]) {
    records.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.room_id.cmp(&b.room_id))
    });
}

/// Durable canvas snapshots, at most one per room.
///
/// Implementations are synchronous; async callers move them onto
/// `spawn_blocking` when latency matters.
pub trait SnapshotStore: Send + Sync {
    /// Idempotent upsert, last write wins.
    fn save_as(
        &self,
        room_id: &str,
        snapshot: &CanvasSnapshot,
        origin: SaveOrigin<'_>,
    ) -> Result<SnapshotRecord, StoreError>;

    /// Explicit save; `saved_by` becomes the saver listed by [`list_saved_by`](Self::list_saved_by).
    fn save(
        &self,
        room_id: &str,
        snapshot: &CanvasSnapshot,
        saved_by: &str,
    ) -> Result<SnapshotRecord, StoreError> {
        self.save_as(room_id, snapshot, SaveOrigin::Explicit(saved_by))
    }

    /// Draw-path save. Keeps the existing saver.
    fn save_drawing(
        &self,
        room_id: &str,
        snapshot: &CanvasSnapshot,
        drawn_by: &str,
    ) -> Result<SnapshotRecord, StoreError> {
        self.save_as(room_id, snapshot, SaveOrigin::Drawing(drawn_by))
    }

    /// `None` when nothing was ever saved for the room.
    fn load(&self, room_id: &str) -> Result<Option<CanvasSnapshot>, StoreError>;

    fn record(&self, room_id: &str) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Returns whether a snapshot existed.
    fn delete(&self, room_id: &str) -> Result<bool, StoreError>;

    /// Snapshots saved by `identity`, most recently updated first.
    fn list_saved_by(&self, identity: &str) -> Result<Vec<SnapshotRecord>, StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Durable room records so rooms outlive the process.
pub trait RoomStore: Send + Sync {
    fn put_room(&self, room: &Room) -> Result<(), StoreError>;

    fn load_rooms(&self) -> Result<Vec<Room>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_upsert_preserves_created_at() {
        let snap = CanvasSnapshot::new(b"data:image/png;base64,AAAA".to_vec(), 800, 600);
        let mut first =
            SnapshotRecord::upsert(None, "room0001", &snap, SaveOrigin::Explicit("alice"), 10);
        first.created_at = 1_000;

        let second =
            SnapshotRecord::upsert(Some(&first), "room0001", &snap, SaveOrigin::Explicit("bob"), 12);
        assert_eq!(second.created_at, 1_000);
        assert!(second.is_saved_by("bob"));
        assert_eq!(second.size, snap.data.len() as u64);
        assert_eq!(second.compressed_size, 12);
    }

    #[test]
    fn test_drawing_keeps_saver() {
        let snap = CanvasSnapshot::new(vec![1, 2, 3], 10, 20);
        let saved =
            SnapshotRecord::upsert(None, "room0001", &snap, SaveOrigin::Explicit("alice"), 3);
        let drawn =
            SnapshotRecord::upsert(Some(&saved), "room0001", &snap, SaveOrigin::Drawing("guest2"), 3);
        assert!(drawn.is_saved_by("alice"));
        assert_eq!(drawn.last_drawn_by.as_deref(), Some("guest2"));

        let resaved =
            SnapshotRecord::upsert(Some(&drawn), "room0001", &snap, SaveOrigin::Explicit("bob"), 3);
        assert!(resaved.is_saved_by("bob"));
        assert_eq!(resaved.last_drawn_by.as_deref(), Some("guest2"));
    }

    #[test]
    fn test_drawing_first_has_no_saver() {
        let snap = CanvasSnapshot::new(vec![1], 1, 1);
        let drawn = SnapshotRecord::upsert(None, "room0001", &snap, SaveOrigin::Drawing("alice"), 1);
        assert_eq!(drawn.saved_by, None);
        assert!(!drawn.is_saved_by("alice"));
    }

    #[test]
    fn test_record_encode_decode() {
        let snap = CanvasSnapshot::new(vec![1, 2, 3], 10, 20);
        let record = SnapshotRecord::upsert(None, "room0001", &snap, SaveOrigin::Explicit("alice"), 3);
        let bytes = record.encode().unwrap();
        assert_eq!(SnapshotRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_record_decode_garbage() {
        assert!(matches!(
            SnapshotRecord::decode(&[0xff, 0xff, 0xff]),
            Err(StoreError::Deserialization(_))
        ));
    }

    #[test]
    fn test_sort_newest_first() {
        let snap = CanvasSnapshot::new(vec![1], 1, 1);
        let mut a = SnapshotRecord::upsert(None, "aaaa", &snap, SaveOrigin::Explicit("x"), 1);
        let mut b = SnapshotRecord::upsert(None, "bbbb", &snap, SaveOrigin::Explicit("x"), 1);
        let mut c = SnapshotRecord::upsert(None, "cccc", &snap, SaveOrigin::Explicit("x"), 1);
        a.updated_at = 10;
        b.updated_at = 30;
        c.updated_at = 10;

        let mut records = vec![a, b, c];
        sort_newest_first(&mut records);
        let order: Vec<&str> = records.iter().map(|r| r.room_id.as_str()).collect();
        assert_eq!(order, vec!["bbbb", "aaaa", "cccc"]);
    }
}
