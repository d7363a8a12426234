//! Persistence for canvas snapshots and room records.
//!
//! Architecture:
//! ```text
//! ┌────────────────────┐  draw-commit (spawn_blocking)  ┌─────────────────────┐
//! │ SessionCoordinator │ ─────────────────────────────► │ SnapshotStore       │
//! │                    │  explicit save / load          │  ├─ MemoryStore     │
//! └─────────┬──────────┘ ─────────────────────────────► │  └─ RocksStore      │
//!           │                                           └──────────┬──────────┘
//!           │ write-through                                        │
//!           ▼                                                      ▼
//! ┌────────────────────┐                     ┌─────────────────────────────────┐
//! │ RoomRegistry       │ ──── RoomStore ───► │ CF "snapshots" - LZ4 canvas     │
//! └────────────────────┘                     │ CF "metadata"  - SnapshotRecord │
//!                                            │ CF "rooms"     - Room records   │
//!                                            └─────────────────────────────────┘
//! ```
//!
//! Both stores expose a single idempotent upsert per room: saving over an
//! existing snapshot replaces it and keeps the original `created_at`.
//! Draw-path saves replace the canvas but never the identity that saved it.
//!
//! ## Performance Targets
//!
//! | Metric                     | Target |
//! |----------------------------|--------|
//! | Snapshot save (256KB)      | <2ms   |
//! | Snapshot load (cache hot)  | <1ms   |
//! | Room record write-through  | <50μs  |

pub mod memory;
pub mod rocks;
pub mod snapshot;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};
pub use snapshot::{
    CanvasSnapshot, RoomStore, SaveOrigin, SnapshotRecord, SnapshotStore, StoreError,
};
