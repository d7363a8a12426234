//! Room-scoped fan-out of [`RoomEvent`]s with backpressure.
//!
//! Every room has one tokio broadcast channel, so events for a room reach each
//! subscriber in publish order. Targeted delivery (to one participant or one
//! connection) travels through the same channel and is filtered on the
//! receiving side, which keeps it ordered relative to room-wide events.
//!
//! Delivery is best-effort: a subscriber that falls more than `capacity`
//! messages behind loses the oldest ones. There is no replay; a client that
//! missed state asks for a resync.
//!
//! Performance target: 1,000 events to 100 connections < 10ms

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::RoomEvent;
use crate::room::{ParticipantId, RoomId};

pub type ConnectionId = Uuid;

/// A transport connection, optionally bound to a room member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub participant: Option<ParticipantId>,
}

impl ConnectionInfo {
    /// Fresh connection that has not claimed an identity yet.
    pub fn anonymous() -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            participant: None,
        }
    }

    pub fn for_participant(participant: impl Into<ParticipantId>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            participant: Some(participant.into()),
        }
    }

    pub fn is_participant(&self, identity: &str) -> bool {
        self.participant.as_deref() == Some(identity)
    }
}

/// Who an envelope is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every connection in the room, minus an optional excluded one.
    Room { exclude: Option<ConnectionId> },
    /// Every connection bound to this participant.
    Participant(ParticipantId),
    /// Exactly one connection.
    Connection(ConnectionId),
}

impl Recipient {
    pub fn matches(&self, connection: &ConnectionInfo) -> bool {
        match self {
            Recipient::Room { exclude } => *exclude != Some(connection.connection_id),
            Recipient::Participant(id) => connection.is_participant(id),
            Recipient::Connection(id) => *id == connection.connection_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub recipient: Recipient,
    pub event: RoomEvent,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// Lock-free counters updated on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A connection's view of one room's event stream.
pub struct Subscription {
    room_id: RoomId,
    connection: ConnectionInfo,
    receiver: broadcast::Receiver<Arc<Envelope>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Next event addressed to this connection.
    ///
    /// Lagged messages are counted and skipped. Returns `None` once the
    /// room's channel is closed.
    pub async fn recv(&mut self) -> Option<RoomEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    if envelope.recipient.matches(&self.connection) {
                        return Some(envelope.event.clone());
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    self.record_lag(n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<RoomEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    if envelope.recipient.matches(&self.connection) {
                        return Some(envelope.event.clone());
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    self.record_lag(n);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
        log::warn!(
            "Connection {} lagged by {n} messages in room {}",
            self.connection.connection_id,
            self.room_id
        );
    }
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    room_id: RoomId,
    sender: broadcast::Sender<Arc<Envelope>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many events a subscriber may fall behind before it
    /// starts losing them.
    pub fn new(room_id: impl Into<RoomId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            room_id: room_id.into(),
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a connection. Re-adding an existing connection replaces its
    /// binding and hands out a fresh subscription.
    pub async fn add_connection(&self, connection: ConnectionInfo) -> Subscription {
        let mut connections = self.connections.write().await;
        connections.insert(connection.connection_id, connection.clone());
        Subscription {
            room_id: self.room_id.clone(),
            connection,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub async fn remove_connection(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.write().await.remove(connection_id)
    }

    /// Hand an envelope to every subscriber. Returns the subscriber count.
    pub fn send(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(Arc::new(envelope)).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn has_connection(&self, connection_id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    /// Connections bound to `participant`.
    pub async fn connections_of(&self, participant: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.is_participant(participant))
            .count()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids to their fan-out groups.
pub struct BroadcastChannel {
    groups: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
    capacity: usize,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn group(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.groups.read().await.get(room_id).cloned()
    }

    /// Admit a connection to a room's fan-out, creating the group on first use.
    ///
    /// Holds the map lock while admitting so a concurrent `leave` cannot drop
    /// the group between lookup and insert.
    pub async fn join(&self, connection: &ConnectionInfo, room_id: &str) -> Subscription {
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(room_id, self.capacity)))
            .clone();
        let subscription = group.add_connection(connection.clone()).await;
        drop(groups);
        log::debug!("Connection {} joined channel {room_id}", connection.connection_id);
        subscription
    }

    /// Drop a connection from a room. Empty groups are removed.
    pub async fn leave(&self, connection_id: &ConnectionId, room_id: &str) -> Option<ConnectionInfo> {
        let mut groups = self.groups.write().await;
        let group = groups.get(room_id)?.clone();
        let removed = group.remove_connection(connection_id).await;
        if group.connection_count().await == 0 {
            groups.remove(room_id);
            log::debug!("Channel {room_id} removed (empty)");
        }
        removed
    }

    pub async fn is_subscribed(&self, connection_id: &ConnectionId, room_id: &str) -> bool {
        match self.group(room_id).await {
            Some(group) => group.has_connection(connection_id).await,
            None => false,
        }
    }

    async fn deliver(&self, room_id: &str, recipient: Recipient, event: RoomEvent) -> usize {
        match self.group(room_id).await {
            Some(group) => group.send(Envelope { recipient, event }),
            None => 0,
        }
    }

    /// Deliver to every connection in the room except `exclude`.
    /// Returns how many subscribers the event was handed to (0 for an
    /// unknown room).
    pub async fn publish(&self, room_id: &str, event: RoomEvent, exclude: Option<ConnectionId>) -> usize {
        log::trace!("Publishing {} to room {room_id}", event.name());
        self.deliver(room_id, Recipient::Room { exclude }, event).await
    }

    pub async fn send_to_participant(&self, room_id: &str, participant: &str, event: RoomEvent) -> usize {
        self.deliver(room_id, Recipient::Participant(participant.to_string()), event)
            .await
    }

    pub async fn send_to_connection(
        &self,
        room_id: &str,
        connection_id: ConnectionId,
        event: RoomEvent,
    ) -> usize {
        self.deliver(room_id, Recipient::Connection(connection_id), event)
            .await
    }

    pub async fn send_to(&self, room_id: &str, recipient: Recipient, event: RoomEvent) -> usize {
        self.deliver(room_id, recipient, event).await
    }

    pub async fn connection_count(&self, room_id: &str) -> usize {
        match self.group(room_id).await {
            Some(group) => group.connection_count().await,
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.groups.read().await.keys().cloned().collect()
    }

    pub async fn stats(&self, room_id: &str) -> Option<BroadcastStats> {
        match self.group(room_id).await {
            Some(group) => Some(group.stats().await),
            None => None,
        }
    }
}
