//! RocksDB-backed snapshot and room store.
//!
//! Column families:
//! - `snapshots` - Canvas snapshot bytes (LZ4 compressed, keyed by room id)
//! - `metadata`  - `SnapshotRecord` per room (bincode)
//! - `rooms`     - `Room` records written through by the registry (bincode)
//!
//! Snapshot bytes and their metadata are written in one `WriteBatch` and read
//! through one database snapshot, so a reader never pairs one save's canvas
//! with another save's metadata. Read-modify-write of the metadata is
//! serialized per store.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::room::Room;

use super::snapshot::{
    sort_newest_first, CanvasSnapshot, RoomStore, SaveOrigin, SnapshotRecord, SnapshotStore,
    StoreError,
};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("drawroom_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed store for canvas snapshots and room records.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Already LZ4 framed by us
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA | CF_ROOMS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    fn load_record(&self, room_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(SnapshotRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of stored snapshots.
    pub fn snapshot_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("snapshot write lock poisoned".into()))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl SnapshotStore for RocksStore {
    fn save_as(
        &self,
        room_id: &str,
        snapshot: &CanvasSnapshot,
        origin: SaveOrigin<'_>,
    ) -> Result<SnapshotRecord, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(&snapshot.data);
        let _guard = self.lock_writes()?;
        let previous = self.load_record(room_id)?;
        let record = SnapshotRecord::upsert(
            previous.as_ref(),
            room_id,
            snapshot,
            origin,
            compressed.len() as u64,
        );

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_snap, room_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, room_id.as_bytes(), record.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        log::debug!(
            "Saved snapshot for room {room_id}: {} bytes ({} compressed)",
            record.size,
            record.compressed_size
        );
        Ok(record)
    }

    fn load(&self, room_id: &str) -> Result<Option<CanvasSnapshot>, StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let view = self.db.snapshot();
        let compressed = match view.get_cf(cf_snap, room_id.as_bytes())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let record = match view.get_cf(cf_meta, room_id.as_bytes())? {
            Some(bytes) => SnapshotRecord::decode(&bytes)?,
            None => {
                return Err(StoreError::Database(format!(
                    "snapshot for room {room_id} has no metadata"
                )))
            }
        };
        drop(view);

        let data = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;

        Ok(Some(CanvasSnapshot {
            data,
            width: record.width,
            height: record.height,
            updated_at: record.updated_at,
        }))
    }

    fn record(&self, room_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        self.load_record(room_id)
    }

    fn delete(&self, room_id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock_writes()?;
        if self.load_record(room_id)?.is_none() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_SNAPSHOTS)?, room_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, room_id.as_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(true)
    }

    fn list_saved_by(&self, identity: &str) -> Result<Vec<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record = SnapshotRecord::decode(&value)?;
            if record.is_saved_by(identity) {
                records.push(record);
            }
        }
        sort_newest_first(&mut records);
        Ok(records)
    }

    fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

impl RoomStore for RocksStore {
    fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        self.db
            .put_cf_opt(cf, room.id.as_bytes(), room.encode()?, &self.write_opts())?;
        Ok(())
    }

    fn load_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match Room::decode(&value) {
                Ok(room) => rooms.push(room),
                Err(e) => log::warn!(
                    "Skipping unreadable room record {}: {e}",
                    String::from_utf8_lossy(&key)
                ),
            }
        }
        Ok(rooms)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.snapshot_count().unwrap(), 0);
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let data = b"data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk".to_vec();

        let record = store
            .save("room0001", &CanvasSnapshot::new(data.clone(), 1024, 768), "alice")
            .unwrap();
        assert_eq!(record.size, data.len() as u64);
        assert!(record.compressed_size > 0);

        let loaded = store.load("room0001").unwrap().unwrap();
        assert_eq!(loaded.data, data);
        assert_eq!((loaded.width, loaded.height), (1024, 768));
        assert_eq!(loaded.updated_at, record.updated_at);
    }

    #[test]
    fn test_snapshot_missing() {
        let (_dir, store) = open_temp();
        assert!(store.load("nothing1").unwrap().is_none());
        assert!(store.record("nothing1").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_compression() {
        let (_dir, store) = open_temp();
        let data = vec![b'A'; 64 * 1024];
        let record = store
            .save("room0001", &CanvasSnapshot::new(data, 256, 256), "alice")
            .unwrap();
        assert!(record.compressed_size < record.size / 10);
    }

    #[test]
    fn test_overwrite_keeps_single_record() {
        let (_dir, store) = open_temp();
        let first = store
            .save("room0001", &CanvasSnapshot::new(b"S1".to_vec(), 10, 10), "alice")
            .unwrap();
        let second = store
            .save("room0001", &CanvasSnapshot::new(b"S2".to_vec(), 20, 20), "alice")
            .unwrap();

        assert_eq!(store.snapshot_count().unwrap(), 1);
        assert_eq!(second.created_at, first.created_at);
        let loaded = store.load("room0001").unwrap().unwrap();
        assert_eq!(loaded.data, b"S2");
        assert_eq!(loaded.width, 20);
    }

    #[test]
    fn test_drawing_save_keeps_saver() {
        let (_dir, store) = open_temp();
        store
            .save("room0001", &CanvasSnapshot::new(b"S1".to_vec(), 10, 10), "alice")
            .unwrap();
        let record = store
            .save_drawing("room0001", &CanvasSnapshot::new(b"S2".to_vec(), 30, 40), "guest2")
            .unwrap();
        assert!(record.is_saved_by("alice"));
        assert_eq!(record.last_drawn_by.as_deref(), Some("guest2"));

        assert_eq!(store.list_saved_by("alice").unwrap().len(), 1);
        assert!(store.list_saved_by("guest2").unwrap().is_empty());
    }

    #[test]
    fn test_load_pairs_canvas_with_its_metadata() {
        let (_dir, store) = open_temp();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200u32 {
                    let snap = CanvasSnapshot::new(vec![(i % 2) as u8; 16], i % 2 + 1, i % 2 + 1);
                    store.save_drawing("room0001", &snap, "alice").unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    if let Some(loaded) = store.load("room0001").unwrap() {
                        assert_eq!(loaded.width, u32::from(loaded.data[0]) + 1);
                        assert_eq!(loaded.height, loaded.width);
                    }
                }
            });
        });
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = open_temp();
        store
            .save("room0001", &CanvasSnapshot::new(b"S1".to_vec(), 10, 10), "alice")
            .unwrap();
        assert!(store.delete("room0001").unwrap());
        assert!(!store.delete("room0001").unwrap());
        assert!(store.load("room0001").unwrap().is_none());
    }

    #[test]
    fn test_room_records() {
        let (_dir, store) = open_temp();
        let mut room = Room::new("room0001", "alice");
        store.put_room(&room).unwrap();
        room.participants.push("guest2".into());
        store.put_room(&room).unwrap();

        let rooms = store.load_rooms().unwrap();
        assert_eq!(rooms, vec![room]);
    }

    #[test]
    fn test_flush() {
        let (_dir, store) = open_temp();
        store
            .save("room0001", &CanvasSnapshot::new(b"S1".to_vec(), 10, 10), "alice")
            .unwrap();
        store.flush().unwrap();
    }
}
