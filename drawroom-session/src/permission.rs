//! Single-writer drawing permission.
//!
//! Exactly one participant per room may draw. Only the room owner moves that
//! permission, and the move is one registry mutation from the previous drawer
//! straight to the target, so there is never a moment with zero or two
//! drawers.

use std::sync::Arc;

use crate::broadcast::BroadcastChannel;
use crate::error::SessionError;
use crate::protocol::RoomEvent;
use crate::room::{ParticipantId, RoomId, RoomRegistry};

/// Outcome of a permission transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawerHandoff {
    pub room_id: RoomId,
    pub previous: Option<ParticipantId>,
    pub current: ParticipantId,
}

impl DrawerHandoff {
    /// True when the drawer actually changed hands.
    pub fn changed(&self) -> bool {
        self.previous.as_deref() != Some(self.current.as_str())
    }
}

pub struct DrawerPermissionManager {
    registry: Arc<RoomRegistry>,
    channel: Arc<BroadcastChannel>,
}

impl DrawerPermissionManager {
    pub fn new(registry: Arc<RoomRegistry>, channel: Arc<BroadcastChannel>) -> Self {
        Self { registry, channel }
    }

    /// Give the drawing permission to `target`.
    ///
    /// `requested_by` must own the room. Re-granting to the current drawer
    /// is allowed and announced again.
    pub async fn grant(
        &self,
        room_id: &str,
        requested_by: &str,
        target: &str,
    ) -> Result<DrawerHandoff, SessionError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(SessionError::validation("target identity must not be empty"));
        }

        let handoff = self
            .registry
            .modify(room_id, |room| {
                if !room.is_owner(requested_by) {
                    return Err(SessionError::denied(format!(
                        "{requested_by} does not own room {room_id}"
                    )));
                }
                let previous = room.assign_drawer(target);
                Ok((
                    DrawerHandoff {
                        room_id: room_id.to_string(),
                        previous,
                        current: target.to_string(),
                    },
                    true,
                ))
            })
            .await
            .inspect_err(|e| log::debug!("Grant in room {room_id} rejected: {e}"))?;

        log::info!(
            "Room {room_id}: drawer {:?} -> {}",
            handoff.previous,
            handoff.current
        );
        self.announce(&handoff).await;
        Ok(handoff)
    }

    /// Hand the permission back to the owner.
    pub async fn revoke(&self, room_id: &str, requested_by: &str) -> Result<DrawerHandoff, SessionError> {
        let owner = self.registry.get_room(room_id).await?.owner_id;
        self.grant(room_id, requested_by, &owner).await
    }

    pub async fn current_drawer(&self, room_id: &str) -> Result<Option<ParticipantId>, SessionError> {
        self.registry.current_drawer(room_id).await
    }

    pub async fn can_draw(&self, room_id: &str, identity: &str) -> Result<bool, SessionError> {
        Ok(self.current_drawer(room_id).await?.as_deref() == Some(identity))
    }

    /// `drawer-changed` to the whole room, `resync-required` to the new drawer.
    async fn announce(&self, handoff: &DrawerHandoff) {
        let room_id = &handoff.room_id;
        self.channel
            .publish(
                room_id,
                RoomEvent::DrawerChanged {
                    drawer_id: handoff.current.clone(),
                },
                None,
            )
            .await;
        self.channel
            .send_to_participant(
                room_id,
                &handoff.current,
                RoomEvent::ResyncRequired {
                    room_id: room_id.clone(),
                },
            )
            .await;
    }
}
