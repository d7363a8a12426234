//! In-memory store for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::room::{Room, RoomId};

use super::snapshot::{
    sort_newest_first, CanvasSnapshot, RoomStore, SaveOrigin, SnapshotRecord, SnapshotStore,
    StoreError,
};

struct StoredSnapshot {
    snapshot: CanvasSnapshot,
    record: SnapshotRecord,
}

/// Process-local [`SnapshotStore`] and [`RoomStore`]. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<RoomId, StoredSnapshot>>,
    rooms: RwLock<HashMap<RoomId, Room>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl SnapshotStore for MemoryStore {
    fn save_as(
        &self,
        room_id: &str,
        snapshot: &CanvasSnapshot,
        origin: SaveOrigin<'_>,
    ) -> Result<SnapshotRecord, StoreError> {
        let mut snapshots = write(&self.snapshots)?;
        let previous = snapshots.get(room_id).map(|s| &s.record);
        let record = SnapshotRecord::upsert(
            previous,
            room_id,
            snapshot,
            origin,
            snapshot.data.len() as u64,
        );

        let mut stored = snapshot.clone();
        stored.updated_at = record.updated_at;
        snapshots.insert(
            room_id.to_string(),
            StoredSnapshot {
                snapshot: stored,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    fn load(&self, room_id: &str) -> Result<Option<CanvasSnapshot>, StoreError> {
        Ok(read(&self.snapshots)?.get(room_id).map(|s| s.snapshot.clone()))
    }

    fn record(&self, room_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(read(&self.snapshots)?.get(room_id).map(|s| s.record.clone()))
    }

    fn delete(&self, room_id: &str) -> Result<bool, StoreError> {
        Ok(write(&self.snapshots)?.remove(room_id).is_some())
    }

    fn list_saved_by(&self, identity: &str) -> Result<Vec<SnapshotRecord>, StoreError> {
        let mut records: Vec<SnapshotRecord> = read(&self.snapshots)?
            .values()
            .filter(|s| s.record.is_saved_by(identity))
            .map(|s| s.record.clone())
            .collect();
        sort_newest_first(&mut records);
        Ok(records)
    }
}

impl RoomStore for MemoryStore {
    fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        write(&self.rooms)?.insert(room.id.clone(), room.clone());
        Ok(())
    }

    fn load_rooms(&self) -> Result<Vec<Room>, StoreError> {
        Ok(read(&self.rooms)?.values().cloned().collect())
    }
}
