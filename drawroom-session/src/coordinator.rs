//! Session coordination: the single entry point for every client action.
//!
//! ```text
//!   InboundEvent / Request
//!            │
//!            ▼
//!   SessionCoordinator ──► RoomRegistry ◄── DrawerPermissionManager
//!            │                  │
//!            │                  └─ write-through ─► RoomStore
//!            ├──► BroadcastChannel ──► Subscription per connection
//!            ├──► ResyncTracker (request-canvas-state bookkeeping)
//!            └──► SnapshotStore (draw-path saves on spawn_blocking)
//! ```
//!
//! Registry mutations complete before any broadcast is awaited, and
//! draw-path persistence never blocks the relay. Two draw commits racing
//! around a handoff resolve as "last broadcast wins" on the clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::broadcast::{BroadcastChannel, ConnectionInfo, Recipient, Subscription};
use crate::error::SessionError;
use crate::identity::{self, DEFAULT_OWNER};
use crate::permission::{DrawerHandoff, DrawerPermissionManager};
use crate::protocol::{CanvasFrame, InboundEvent, Request, Response, RoomEvent};
use crate::resync::{ResyncTracker, DEFAULT_RESYNC_TIMEOUT};
use crate::room::{self, ParticipantId, RoomId, RoomRegistry, SessionInfo};
use crate::storage::{CanvasSnapshot, MemoryStore, SnapshotRecord, SnapshotStore};

/// Default per-subscriber buffer for room fan-out.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Tunables for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub broadcast_capacity: usize,
    pub resync_timeout: Duration,
    /// Connections admitted to one room's channel.
    pub max_connections_per_room: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            resync_timeout: DEFAULT_RESYNC_TIMEOUT,
            max_connections_per_room: 100,
        }
    }
}

/// Identity inputs for a join, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinIdentity {
    /// Verified user id from the authentication provider.
    pub authenticated: Option<String>,
    /// Name chosen by an anonymous caller.
    pub guest_name: Option<String>,
}

impl JoinIdentity {
    pub fn authenticated(id: impl Into<String>) -> Self {
        Self {
            authenticated: Some(id.into()),
            guest_name: None,
        }
    }

    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            authenticated: None,
            guest_name: Some(name.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomCreated {
    pub room_id: RoomId,
    pub owner_id: ParticipantId,
}

/// What happened to an incoming canvas push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    /// Sender is the drawer: relayed and queued for persistence.
    Relayed { recipients: usize },
    /// Sender is not the drawer but answered pending resync requests.
    ResyncAnswered { requesters: usize },
    /// Neither; nothing was sent.
    Dropped,
}

/// Result of dispatching one inbound event.
pub enum Dispatch {
    Joined(Subscription),
    Left { was_member: bool },
    Drawn(DrawOutcome),
    CanvasRequested { recipients: usize },
}

pub struct SessionCoordinator {
    registry: Arc<RoomRegistry>,
    channel: Arc<BroadcastChannel>,
    permissions: DrawerPermissionManager,
    snapshots: Arc<dyn SnapshotStore>,
    resync: ResyncTracker,
    background: Mutex<JoinSet<()>>,
    config: CoordinatorConfig,
}

impl SessionCoordinator {
    pub fn new(
        registry: Arc<RoomRegistry>,
        snapshots: Arc<dyn SnapshotStore>,
        config: CoordinatorConfig,
    ) -> Self {
        let channel = Arc::new(BroadcastChannel::new(config.broadcast_capacity));
        Self {
            permissions: DrawerPermissionManager::new(registry.clone(), channel.clone()),
            resync: ResyncTracker::new(config.resync_timeout),
            registry,
            channel,
            snapshots,
            background: Mutex::new(JoinSet::new()),
            config,
        }
    }

    /// Everything in memory, default tunables.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(RoomRegistry::new()),
            Arc::new(MemoryStore::new()),
            CoordinatorConfig::default(),
        )
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn channel(&self) -> &Arc<BroadcastChannel> {
        &self.channel
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    pub fn resync(&self) -> &ResyncTracker {
        &self.resync
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ─── Rooms & membership ───────────────────────────────────────────

    /// Create a room. Without an authenticated identity the owner is `guest1`.
    pub async fn create_room(&self, owner_identity: Option<&str>) -> Result<RoomCreated, SessionError> {
        let owner = identity::non_blank(owner_identity).unwrap_or(DEFAULT_OWNER);
        let room_id = self.registry.create_room(owner).await?;
        Ok(RoomCreated {
            room_id,
            owner_id: owner.to_string(),
        })
    }

    /// Admit a participant. Announces `user-joined` to the rest of the room
    /// only when the identity is new.
    pub async fn join(
        &self,
        room_id: &str,
        who: JoinIdentity,
        connection: Option<&ConnectionInfo>,
    ) -> Result<ParticipantId, SessionError> {
        let requested = match identity::non_blank(who.authenticated.as_deref()) {
            Some(id) => Some(id.to_string()),
            None => match who.guest_name.as_deref() {
                Some(name) => {
                    identity::validate_guest_name(name)?;
                    Some(name.to_string())
                }
                None => None,
            },
        };

        let admission = self
            .registry
            .add_participant(room_id, requested.as_deref())
            .await?;

        if admission.newly_added {
            log::info!("{} joined room {room_id}", admission.participant_id);
            self.channel
                .publish(
                    room_id,
                    RoomEvent::UserJoined {
                        participant_name: admission.participant_id.clone(),
                    },
                    connection.map(|c| c.connection_id),
                )
                .await;
        }
        Ok(admission.participant_id)
    }

    /// Subscribe a connection to a room's events.
    pub async fn join_channel(
        &self,
        connection: &ConnectionInfo,
        room_id: &str,
    ) -> Result<Subscription, SessionError> {
        let room = self.registry.get_room(room_id).await?;
        let rejoining = self
            .channel
            .is_subscribed(&connection.connection_id, room_id)
            .await;
        if !rejoining
            && self.channel.connection_count(room_id).await >= self.config.max_connections_per_room
        {
            return Err(SessionError::validation(format!(
                "room {room_id} is full ({} connections)",
                self.config.max_connections_per_room
            )));
        }
        if let Some(participant) = &connection.participant {
            if !room.is_member(participant) {
                log::debug!(
                    "Connection {} bound to {participant}, not a member of {room_id}",
                    connection.connection_id
                );
            }
        }

        Ok(self.channel.join(connection, room_id).await)
    }

    /// Remove a connection from a room's channel. Membership is untouched.
    pub async fn leave(&self, connection: &ConnectionInfo, room_id: &str) -> bool {
        let removed = self
            .channel
            .leave(&connection.connection_id, room_id)
            .await
            .is_some();
        self.resync.forget_connection(connection).await;

        if removed {
            if let Some(participant) = &connection.participant {
                self.channel
                    .publish(
                        room_id,
                        RoomEvent::UserLeft {
                            participant_name: participant.clone(),
                        },
                        Some(connection.connection_id),
                    )
                    .await;
            }
        }
        removed
    }

    /// Claim ownership of a room still owned by `guest1`.
    pub async fn claim_ownership(&self, room_id: &str, identity: &str) -> Result<bool, SessionError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(SessionError::validation("identity must not be empty"));
        }
        self.registry.set_owner(room_id, identity).await
    }

    pub async fn session_info(&self, room_id: &str) -> Result<SessionInfo, SessionError> {
        self.registry.session_info(room_id).await
    }

    // ─── Drawing permission ───────────────────────────────────────────

    /// Owner-only permission transfer. The outgoing drawer is asked for one
    /// final canvas push, which is forwarded to the new drawer.
    pub async fn grant_drawer(
        &self,
        room_id: &str,
        requested_by: &str,
        target: &str,
    ) -> Result<DrawerHandoff, SessionError> {
        let handoff = self.permissions.grant(room_id, requested_by, target).await?;
        self.request_final_push(&handoff).await;
        Ok(handoff)
    }

    pub async fn revoke_drawer(&self, room_id: &str, requested_by: &str) -> Result<DrawerHandoff, SessionError> {
        let handoff = self.permissions.revoke(room_id, requested_by).await?;
        self.request_final_push(&handoff).await;
        Ok(handoff)
    }

    async fn request_final_push(&self, handoff: &DrawerHandoff) {
        let previous = match &handoff.previous {
            Some(p) if handoff.changed() => p,
            _ => return,
        };
        self.resync
            .register(&handoff.room_id, Recipient::Participant(handoff.current.clone()))
            .await;
        self.channel
            .send_to_participant(
                &handoff.room_id,
                previous,
                RoomEvent::RequestCanvasState {
                    room_id: handoff.room_id.clone(),
                },
            )
            .await;
    }

    // ─── Canvas relay & resync ────────────────────────────────────────

    /// Handle a `whiteboard-update` from a connection.
    pub async fn commit_drawing(
        &self,
        connection: &ConnectionInfo,
        frame: CanvasFrame,
    ) -> Result<DrawOutcome, SessionError> {
        let room = self.registry.get_room(&frame.room_id).await?;
        let room_id = room.id.clone();

        if let Some(drawer) = connection.participant.as_deref().filter(|p| room.is_drawer(p)) {
            self.persist_in_background(&room_id, frame.to_snapshot(), drawer)
                .await;
            let recipients = self
                .channel
                .publish(
                    &room_id,
                    RoomEvent::WhiteboardUpdate(frame),
                    Some(connection.connection_id),
                )
                .await;
            return Ok(DrawOutcome::Relayed { recipients });
        }

        if !self
            .channel
            .is_subscribed(&connection.connection_id, &room_id)
            .await
        {
            log::debug!(
                "Dropping canvas push for room {room_id} from unsubscribed connection {}",
                connection.connection_id
            );
            return Ok(DrawOutcome::Dropped);
        }

        let requesters = self.resync.take_for_response(&room_id, connection).await;
        if requesters.is_empty() {
            log::debug!(
                "Dropping canvas push from non-drawer {:?} in room {room_id}",
                connection.participant
            );
            return Ok(DrawOutcome::Dropped);
        }

        let answered = requesters.len();
        for requester in requesters {
            self.channel
                .send_to(&room_id, requester, RoomEvent::WhiteboardUpdate(frame.clone()))
                .await;
        }
        log::debug!("Canvas state for room {room_id} forwarded to {answered} requesters");
        Ok(DrawOutcome::ResyncAnswered { requesters: answered })
    }

    /// Ask the rest of the room for the current surface on behalf of `connection`.
    pub async fn request_canvas_state(
        &self,
        connection: &ConnectionInfo,
        room_id: &str,
    ) -> Result<usize, SessionError> {
        self.registry.get_room(room_id).await?;
        self.resync
            .register(room_id, Recipient::Connection(connection.connection_id))
            .await;
        let recipients = self
            .channel
            .publish(
                room_id,
                RoomEvent::RequestCanvasState {
                    room_id: room_id.to_string(),
                },
                Some(connection.connection_id),
            )
            .await;
        Ok(recipients)
    }

    pub async fn sweep_resyncs(&self) -> usize {
        self.resync.sweep_expired().await
    }

    async fn persist_in_background(&self, room_id: &str, snapshot: CanvasSnapshot, drawn_by: &str) {
        let store = self.snapshots.clone();
        let room_id = room_id.to_string();
        let drawn_by = drawn_by.to_string();

        let mut background = self.background.lock().await;
        while background.try_join_next().is_some() {}
        background.spawn_blocking(move || {
            if let Err(e) = store.save_drawing(&room_id, &snapshot, &drawn_by) {
                log::error!("Failed to persist canvas for room {room_id}: {e}");
            }
        });
    }

    /// Wait for every queued draw-path save to finish.
    pub async fn flush_background_saves(&self) {
        let mut background = self.background.lock().await;
        while let Some(result) = background.join_next().await {
            if let Err(e) = result {
                log::error!("Background save task failed: {e}");
            }
        }
    }

    // ─── Explicit persistence ─────────────────────────────────────────

    pub async fn save_snapshot(
        &self,
        room_id: &str,
        snapshot: CanvasSnapshot,
        saved_by: Option<&str>,
    ) -> Result<SnapshotRecord, SessionError> {
        if room_id.is_empty() {
            return Err(SessionError::validation("room id is required"));
        }
        if snapshot.is_empty() {
            return Err(SessionError::validation("snapshot data is required"));
        }
        let saved_by = identity::non_blank(saved_by)
            .ok_or_else(|| SessionError::validation("identity is required to save"))?;
        self.registry.get_room(room_id).await?;

        let record = self.snapshots.save(room_id, &snapshot, saved_by)?;
        log::info!("Room {room_id} saved by {saved_by} ({} bytes)", record.size);
        Ok(record)
    }

    /// Latest snapshot, `None` when the room was never saved.
    pub async fn load_snapshot(&self, room_id: &str) -> Result<Option<CanvasSnapshot>, SessionError> {
        room::validate_room_id(room_id)?;
        Ok(self.snapshots.load(room_id)?)
    }

    pub async fn list_saved(&self, identity: &str) -> Result<Vec<SnapshotRecord>, SessionError> {
        if identity.trim().is_empty() {
            return Err(SessionError::validation("identity is required"));
        }
        Ok(self.snapshots.list_saved_by(identity)?)
    }

    /// Delete a room's saved snapshot. Only the room owner may do this; for
    /// rooms no longer in the registry, the identity that saved it.
    pub async fn delete_saved(&self, room_id: &str, identity: &str) -> Result<bool, SessionError> {
        room::validate_room_id(room_id)?;
        let record = match self.snapshots.record(room_id)? {
            Some(record) => record,
            None => return Ok(false),
        };

        let allowed = match self.registry.get_room(room_id).await {
            Ok(room) => room.is_owner(identity),
            Err(SessionError::RoomNotFound(_)) => record.is_saved_by(identity),
            Err(e) => return Err(e),
        };
        if !allowed {
            return Err(SessionError::denied(format!(
                "{identity} may not delete the saved whiteboard of room {room_id}"
            )));
        }

        Ok(self.snapshots.delete(room_id)?)
    }

    // ─── Dispatch ─────────────────────────────────────────────────────

    /// Route an inbound event. A successful `JoinChannel` rebinds
    /// `connection` to the supplied participant id.
    pub async fn handle(
        &self,
        connection: &mut ConnectionInfo,
        event: InboundEvent,
    ) -> Result<Dispatch, SessionError> {
        match event {
            InboundEvent::JoinChannel {
                room_id,
                participant_id,
            } => {
                let mut bound = connection.clone();
                if let Some(id) = identity::non_blank(participant_id.as_deref()) {
                    bound.participant = Some(id.to_string());
                }
                let subscription = self.join_channel(&bound, &room_id).await?;
                *connection = bound;
                Ok(Dispatch::Joined(subscription))
            }
            InboundEvent::LeaveChannel { room_id } => Ok(Dispatch::Left {
                was_member: self.leave(connection, &room_id).await,
            }),
            InboundEvent::WhiteboardUpdate(frame) => {
                Ok(Dispatch::Drawn(self.commit_drawing(connection, frame).await?))
            }
            InboundEvent::RequestCanvasState { room_id } => Ok(Dispatch::CanvasRequested {
                recipients: self.request_canvas_state(connection, &room_id).await?,
            }),
        }
    }

    /// Serve a request/response operation.
    pub async fn handle_request(
        &self,
        connection: Option<&ConnectionInfo>,
        request: Request,
    ) -> Result<Response, SessionError> {
        match request {
            Request::CreateRoom { owner_identity } => {
                let created = self.create_room(owner_identity.as_deref()).await?;
                Ok(Response::RoomCreated {
                    room_id: created.room_id,
                    owner_id: created.owner_id,
                })
            }
            Request::JoinRoom {
                room_id,
                identity,
                guest_name,
            } => {
                let identity = JoinIdentity {
                    authenticated: identity,
                    guest_name,
                };
                let participant_id = self.join(&room_id, identity, connection).await?;
                Ok(Response::Joined { participant_id })
            }
            Request::SessionInfo { room_id } => {
                Ok(Response::SessionInfo(self.session_info(&room_id).await?))
            }
            Request::GrantDrawer {
                room_id,
                requested_by,
                target_identity,
            } => {
                self.grant_drawer(&room_id, &requested_by, &target_identity)
                    .await?;
                Ok(Response::Ack { success: true })
            }
            Request::RevokeDrawer {
                room_id,
                requested_by,
            } => {
                self.revoke_drawer(&room_id, &requested_by).await?;
                Ok(Response::Ack { success: true })
            }
            Request::ClaimOwnership { room_id, identity } => {
                let success = self.claim_ownership(&room_id, &identity).await?;
                Ok(Response::Ack { success })
            }
            Request::SaveSnapshot {
                room_id,
                data,
                width,
                height,
                identity,
            } => {
                let snapshot = CanvasSnapshot::new(data, width, height);
                self.save_snapshot(&room_id, snapshot, identity.as_deref())
                    .await?;
                Ok(Response::Ack { success: true })
            }
            Request::LoadSnapshot { room_id } => {
                Ok(Response::Snapshot(self.load_snapshot(&room_id).await?))
            }
            Request::ListSaved { identity } => Ok(Response::SavedList(self.list_saved(&identity).await?)),
            Request::DeleteSaved { room_id, identity } => {
                let success = self.delete_saved(&room_id, &identity).await?;
                Ok(Response::Ack { success })
            }
        }
    }
}
