//! Persistence integration tests.
//!
//! Verifies:
//! - Snapshot save/load through RocksDB survives a reopen
//! - Overwrites keep the original creation time
//! - Saved listings are scoped to the saver and newest first
//! - Room records written through the registry are recovered on restart
//! - Draw-path saves land in the store once background work is flushed
//! - Large canvases compress and load back byte-exact

use std::sync::Arc;
use std::time::{Duration, Instant};

use drawroom_session::broadcast::ConnectionInfo;
use drawroom_session::coordinator::{CoordinatorConfig, JoinIdentity, SessionCoordinator};
use drawroom_session::protocol::CanvasFrame;
use drawroom_session::room::RoomRegistry;
use drawroom_session::storage::{CanvasSnapshot, RocksStore, SnapshotStore, StoreConfig};
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn coordinator_on(store: Arc<RocksStore>) -> SessionCoordinator {
    SessionCoordinator::new(
        Arc::new(RoomRegistry::with_store(store.clone())),
        store,
        CoordinatorConfig::default(),
    )
}

/// A canvas-like payload: long runs with some noise, like a mostly blank PNG.
fn canvas_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i % 97 == 0 { (i % 251) as u8 } else { 0xFF })
        .collect()
}

// ─── Snapshot store ──────────────────────────────────────────────────────────

#[test]
fn test_snapshot_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let store = open_store(&path);
        store
            .save("room0001", &CanvasSnapshot::new(b"persisted".to_vec(), 640, 480), "alice")
            .unwrap();
        store.flush().unwrap();
    }

    let store = open_store(&path);
    let loaded = store.load("room0001").unwrap().unwrap();
    assert_eq!(loaded.data, b"persisted");
    assert_eq!((loaded.width, loaded.height), (640, 480));
    let record = store.record("room0001").unwrap().unwrap();
    assert!(record.is_saved_by("alice"));
}

#[test]
fn test_overwrite_keeps_created_at() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));

    let first = store
        .save("room0001", &CanvasSnapshot::new(b"v1".to_vec(), 1, 1), "alice")
        .unwrap();
    std::thread::sleep(Duration::from_millis(1100));
    let second = store
        .save("room0001", &CanvasSnapshot::new(b"v2".to_vec(), 2, 2), "bob")
        .unwrap();

    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
    assert!(second.is_saved_by("bob"));
    assert_eq!(store.snapshot_count().unwrap(), 1);
}

#[test]
fn test_list_saved_scoped_and_ordered() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let snap = CanvasSnapshot::new(b"S".to_vec(), 1, 1);

    store.save("older001", &snap, "alice").unwrap();
    std::thread::sleep(Duration::from_millis(1100));
    store.save("newer001", &snap, "alice").unwrap();
    store.save("bobs0001", &snap, "bob").unwrap();

    let alice: Vec<String> = store
        .list_saved_by("alice")
        .unwrap()
        .into_iter()
        .map(|r| r.room_id)
        .collect();
    assert_eq!(alice, vec!["newer001", "older001"]);
    assert_eq!(store.list_saved_by("bob").unwrap().len(), 1);
    assert!(store.list_saved_by("carol").unwrap().is_empty());
}

#[test]
fn test_delete_removes_snapshot_and_record() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    store
        .save("room0001", &CanvasSnapshot::new(b"S".to_vec(), 1, 1), "alice")
        .unwrap();

    assert!(store.delete("room0001").unwrap());
    assert!(store.load("room0001").unwrap().is_none());
    assert!(store.record("room0001").unwrap().is_none());
    assert!(!store.delete("room0001").unwrap());
}

#[test]
fn test_large_canvas_compresses() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let data = canvas_bytes(512 * 1024);

    let start = Instant::now();
    let record = store
        .save("bigroom1", &CanvasSnapshot::new(data.clone(), 1920, 1080), "alice")
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(record.size, data.len() as u64);
    assert!(
        record.compressed_size * 4 < record.size,
        "expected at least 4:1, got {} -> {}",
        record.size,
        record.compressed_size
    );
    assert_eq!(store.load("bigroom1").unwrap().unwrap().data, data);
    println!("512KB canvas save: {elapsed:?}");
}

// ─── Through the coordinator ─────────────────────────────────────────────────

#[tokio::test]
async fn test_rooms_recovered_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    let room_id = {
        let coord = coordinator_on(open_store(&path));
        let room_id = coord.create_room(Some("alice")).await.unwrap().room_id;
        coord.join(&room_id, JoinIdentity::anonymous(), None).await.unwrap();
        coord.grant_drawer(&room_id, "alice", "guest2").await.unwrap();
        room_id
    };

    let store = open_store(&path);
    let registry = Arc::new(RoomRegistry::with_store(store.clone()));
    assert_eq!(registry.recover().await.unwrap(), 1);

    let info = registry.session_info(&room_id).await.unwrap();
    assert_eq!(info.owner_id, "alice");
    assert_eq!(info.participants, vec!["alice", "guest2"]);
    assert_eq!(info.current_drawer.as_deref(), Some("guest2"));

    // Guest numbering continues from the recovered membership
    let coord = SessionCoordinator::new(registry, store, CoordinatorConfig::default());
    let next = coord.join(&room_id, JoinIdentity::anonymous(), None).await.unwrap();
    assert_eq!(next, "guest3");
}

#[tokio::test]
async fn test_draw_commit_persisted_in_background() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let coord = coordinator_on(store.clone());

    let room_id = coord.create_room(Some("alice")).await.unwrap().room_id;
    let alice = ConnectionInfo::for_participant("alice");

    for i in 0..5u8 {
        let frame = CanvasFrame::new(room_id.clone(), vec![i; 64], 100, 100);
        coord.commit_drawing(&alice, frame).await.unwrap();
    }
    coord.flush_background_saves().await;

    let saved = store.load(&room_id).unwrap().unwrap();
    assert_eq!(saved.data.len(), 64);
    let record = store.record(&room_id).unwrap().unwrap();
    assert_eq!(record.last_drawn_by.as_deref(), Some("alice"));
    assert!(store.list_saved_by("alice").unwrap().is_empty());
    assert_eq!(store.snapshot_count().unwrap(), 1);
}

#[tokio::test]
async fn test_saved_whiteboard_outlives_room() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    let room_id = {
        let coord = coordinator_on(open_store(&path));
        let room_id = coord.create_room(Some("alice")).await.unwrap().room_id;
        coord
            .save_snapshot(&room_id, CanvasSnapshot::new(b"keep".to_vec(), 1, 1), Some("alice"))
            .await
            .unwrap();

        // A later drawer does not become the saver
        coord
            .join(&room_id, JoinIdentity::authenticated("mallory"), None)
            .await
            .unwrap();
        coord.grant_drawer(&room_id, "alice", "mallory").await.unwrap();
        let mallory = ConnectionInfo::for_participant("mallory");
        coord
            .commit_drawing(&mallory, CanvasFrame::new(room_id.clone(), b"scribble".to_vec(), 1, 1))
            .await
            .unwrap();
        coord.flush_background_saves().await;
        room_id
    };

    // Restart without recovering rooms: only the saver may delete
    let coord = coordinator_on(open_store(&path));
    assert_eq!(coord.list_saved("alice").await.unwrap().len(), 1);
    assert!(coord.list_saved("mallory").await.unwrap().is_empty());
    assert!(coord.delete_saved(&room_id, "mallory").await.is_err());
    assert!(coord.delete_saved(&room_id, "alice").await.unwrap());
    assert!(coord.load_snapshot(&room_id).await.unwrap().is_none());
}
