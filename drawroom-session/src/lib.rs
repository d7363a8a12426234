//! # drawroom-session: Session coordination for collaborative whiteboards
//!
//! Rooms, membership, a single drawing permission per room, canvas relay and
//! snapshot persistence behind a WebSocket server.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌───────────────┐
//! │ SessionClient │ ◄────────────────► │ SessionServer │
//! │ (per user)    │    Binary Proto    │ (central)     │
//! └───────────────┘                    └───────┬───────┘
//!                                              │
//!                                   ┌──────────┴─────────┐
//!                                   │ SessionCoordinator │
//!                                   └──┬──────┬──────┬───┘
//!                                      │      │      │
//!                        ┌─────────────┘      │      └─────────────┐
//!                        ▼                    ▼                    ▼
//!                ┌──────────────┐  ┌──────────────────┐  ┌───────────────┐
//!                │ RoomRegistry │  │ BroadcastChannel │  │ SnapshotStore │
//!                │ + permission │  │ (fan-out)        │  │ (RocksDB/mem) │
//!                └──────────────┘  └──────────────────┘  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`room`] - Room records and the in-memory registry
//! - [`identity`] - Guest id allocation and name rules
//! - [`permission`] - Owner-controlled drawer handoff
//! - [`broadcast`] - Room fan-out with targeted delivery
//! - [`resync`] - Pending `request-canvas-state` bookkeeping
//! - [`storage`] - Snapshot and room persistence
//! - [`protocol`] - Binary wire protocol (bincode-encoded frames)
//! - [`coordinator`] - Entry point for every client action
//! - [`server`] - WebSocket session server
//! - [`client`] - WebSocket session client
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Frame encode + decode (64KB canvas) | <50μs |
//! | Canvas fan-out to 100 connections | <1ms |
//! | Guest id allocation (1K members) | <20μs |

pub mod error;
pub mod identity;
pub mod room;
pub mod permission;
pub mod broadcast;
pub mod resync;
pub mod storage;
pub mod protocol;
pub mod coordinator;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use error::{ErrorKind, SessionError, WireError};
pub use room::{Admission, Participant, ParticipantId, Room, RoomId, RoomRegistry, SessionInfo};
pub use permission::{DrawerHandoff, DrawerPermissionManager};
pub use broadcast::{
    BroadcastChannel, BroadcastGroup, BroadcastStats, ConnectionId, ConnectionInfo, Recipient,
    Subscription,
};
pub use resync::ResyncTracker;
pub use protocol::{
    CanvasFrame, ClientFrame, InboundEvent, ProtocolError, Request, Response, RoomEvent, ServerFrame,
};
pub use coordinator::{
    CoordinatorConfig, Dispatch, DrawOutcome, JoinIdentity, RoomCreated, SessionCoordinator,
};
pub use server::{ServerConfig, ServerStats, SessionServer};
pub use client::{ClientEvent, ConnectionState, SessionClient};
pub use storage::{
    CanvasSnapshot, MemoryStore, RocksStore, RoomStore, SaveOrigin, SnapshotRecord, SnapshotStore,
    StoreConfig, StoreError,
};
