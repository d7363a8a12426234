//! Bounded bookkeeping for `request-canvas-state` round trips.
//!
//! A connection that lacks the current surface (late joiner, new drawer)
//! registers a pending resync. The first canvas push from someone else in the
//! room answers it; later pushes find nothing pending and are ignored. Entries
//! older than the timeout are dropped without notifying anyone, leaving the
//! requester on a blank surface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::broadcast::{ConnectionInfo, Recipient};
use crate::room::RoomId;

pub const DEFAULT_RESYNC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct PendingResync {
    requester: Recipient,
    requested_at: Instant,
}

impl PendingResync {
    fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.requested_at) >= timeout
    }

    fn is_from(&self, responder: &ConnectionInfo) -> bool {
        match &self.requester {
            Recipient::Connection(id) => *id == responder.connection_id,
            Recipient::Participant(id) => responder.is_participant(id),
            Recipient::Room { .. } => false,
        }
    }
}

pub struct ResyncTracker {
    timeout: Duration,
    pending: Mutex<HashMap<RoomId, Vec<PendingResync>>>,
}

impl Default for ResyncTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RESYNC_TIMEOUT)
    }
}

impl ResyncTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register (or refresh) a pending resync for `requester` in `room_id`.
    pub async fn register(&self, room_id: &str, requester: Recipient) {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let entries = pending.entry(room_id.to_string()).or_default();
        match entries.iter_mut().find(|p| p.requester == requester) {
            Some(existing) => existing.requested_at = now,
            None => entries.push(PendingResync {
                requester,
                requested_at: now,
            }),
        }
    }

    /// Claim every live request in `room_id` that `responder` can answer.
    ///
    /// Claimed requests are removed, so a second response finds nothing.
    /// Expired requests are dropped on the way. The responder's own request,
    /// if any, stays pending.
    pub async fn take_for_response(&self, room_id: &str, responder: &ConnectionInfo) -> Vec<Recipient> {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let entries = match pending.get_mut(room_id) {
            Some(entries) => entries,
            None => return Vec::new(),
        };

        let mut answered = Vec::new();
        entries.retain(|p| {
            if p.expired(now, self.timeout) {
                log::debug!("Resync for {:?} in room {room_id} expired", p.requester);
                return false;
            }
            if p.is_from(responder) {
                return true;
            }
            answered.push(p.requester.clone());
            false
        });

        if entries.is_empty() {
            pending.remove(room_id);
        }
        answered
    }

    /// Whether `room_id` has at least one unexpired pending request.
    pub async fn has_pending(&self, room_id: &str) -> bool {
        self.pending_count(room_id).await > 0
    }

    pub async fn pending_count(&self, room_id: &str) -> usize {
        let now = Instant::now();
        self.pending
            .lock()
            .await
            .get(room_id)
            .map_or(0, |entries| {
                entries.iter().filter(|p| !p.expired(now, self.timeout)).count()
            })
    }

    /// Drop every expired request. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let mut removed = 0;
        pending.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|p| !p.expired(now, self.timeout));
            removed += before - entries.len();
            !entries.is_empty()
        });
        if removed > 0 {
            log::debug!("Swept {removed} expired resync requests");
        }
        removed
    }

    /// Forget everything pending for a connection (it went away).
    pub async fn forget_connection(&self, connection: &ConnectionInfo) {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, entries| {
            entries.retain(|p| p.requester != Recipient::Connection(connection.connection_id));
            !entries.is_empty()
        });
    }
}
