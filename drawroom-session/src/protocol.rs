//! Binary wire protocol between whiteboard clients and the session server.
//!
//! Every WebSocket binary message carries exactly one bincode-encoded frame:
//! ```text
//! client ──► server   ClientFrame::Event(InboundEvent)       fire-and-forget
//!                     ClientFrame::Request { request_id, .. } answered once
//!                     ClientFrame::Ping
//!
//! server ──► client   ServerFrame::Welcome { connection_id }  first frame
//!                     ServerFrame::Event { room_id, event }   room fan-out
//!                     ServerFrame::Response { request_id, result }
//!                     ServerFrame::Pong
//! ```
//!
//! Room events keep the names clients already know (`user-joined`,
//! `drawer-changed`, `whiteboard-update`, `request-canvas-state`, ...), see
//! [`RoomEvent::name`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::WireError;
use crate::room::{ParticipantId, RoomId, SessionInfo};
use crate::storage::{CanvasSnapshot, SnapshotRecord};

/// One canvas image pushed by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasFrame {
    pub room_id: RoomId,
    /// Opaque serialized surface (e.g. a PNG data URL)
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CanvasFrame {
    pub fn new(room_id: impl Into<RoomId>, data: impl Into<Vec<u8>>, width: u32, height: u32) -> Self {
        Self {
            room_id: room_id.into(),
            data: data.into(),
            width,
            height,
        }
    }

    pub fn to_snapshot(&self) -> CanvasSnapshot {
        CanvasSnapshot::new(self.data.clone(), self.width, self.height)
    }
}

/// Events a connection sends into its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundEvent {
    /// Subscribe to a room's fan-out. `participant_id` binds the connection
    /// to a member identity; unbound connections only watch.
    JoinChannel {
        room_id: RoomId,
        participant_id: Option<ParticipantId>,
    },
    LeaveChannel {
        room_id: RoomId,
    },
    WhiteboardUpdate(CanvasFrame),
    RequestCanvasState {
        room_id: RoomId,
    },
}

impl InboundEvent {
    pub fn room_id(&self) -> &str {
        match self {
            Self::JoinChannel { room_id, .. }
            | Self::LeaveChannel { room_id }
            | Self::RequestCanvasState { room_id } => room_id,
            Self::WhiteboardUpdate(frame) => &frame.room_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinChannel { .. } => "join-channel",
            Self::LeaveChannel { .. } => "leave-channel",
            Self::WhiteboardUpdate(_) => "whiteboard-update",
            Self::RequestCanvasState { .. } => "request-canvas-state",
        }
    }
}

/// Events fanned out to the connections of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomEvent {
    UserJoined { participant_name: ParticipantId },
    UserLeft { participant_name: ParticipantId },
    DrawerChanged { drawer_id: ParticipantId },
    WhiteboardUpdate(CanvasFrame),
    RequestCanvasState { room_id: RoomId },
    /// Sent to a newly granted drawer: fetch the latest surface before drawing.
    ResyncRequired { room_id: RoomId },
}

impl RoomEvent {
    /// Event name as seen by clients.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::DrawerChanged { .. } => "drawer-changed",
            Self::WhiteboardUpdate(_) => "whiteboard-update",
            Self::RequestCanvasState { .. } => "request-canvas-state",
            Self::ResyncRequired { .. } => "resync-required",
        }
    }
}

/// Request/response operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    CreateRoom {
        owner_identity: Option<String>,
    },
    JoinRoom {
        room_id: RoomId,
        identity: Option<String>,
        guest_name: Option<String>,
    },
    SessionInfo {
        room_id: RoomId,
    },
    GrantDrawer {
        room_id: RoomId,
        requested_by: String,
        target_identity: String,
    },
    RevokeDrawer {
        room_id: RoomId,
        requested_by: String,
    },
    ClaimOwnership {
        room_id: RoomId,
        identity: String,
    },
    SaveSnapshot {
        room_id: RoomId,
        data: Vec<u8>,
        width: u32,
        height: u32,
        identity: Option<String>,
    },
    LoadSnapshot {
        room_id: RoomId,
    },
    ListSaved {
        identity: String,
    },
    DeleteSaved {
        room_id: RoomId,
        identity: String,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create-room",
            Self::JoinRoom { .. } => "join-room",
            Self::SessionInfo { .. } => "session-info",
            Self::GrantDrawer { .. } => "grant-drawer",
            Self::RevokeDrawer { .. } => "revoke-drawer",
            Self::ClaimOwnership { .. } => "claim-ownership",
            Self::SaveSnapshot { .. } => "save-snapshot",
            Self::LoadSnapshot { .. } => "load-snapshot",
            Self::ListSaved { .. } => "list-saved",
            Self::DeleteSaved { .. } => "delete-saved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    RoomCreated { room_id: RoomId, owner_id: ParticipantId },
    Joined { participant_id: ParticipantId },
    SessionInfo(SessionInfo),
    Ack { success: bool },
    Snapshot(Option<CanvasSnapshot>),
    SavedList(Vec<SnapshotRecord>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Event(InboundEvent),
    Request { request_id: u64, request: Request },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Welcome { connection_id: Uuid },
    Event { room_id: RoomId, event: RoomEvent },
    Response {
        request_id: u64,
        result: Result<Response, WireError>,
    },
    Pong,
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timed out")]
    Timeout,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_event_names() {
        let frame = CanvasFrame::new("room0001", b"png".to_vec(), 1, 1);
        assert_eq!(RoomEvent::UserJoined { participant_name: "a".into() }.name(), "user-joined");
        assert_eq!(RoomEvent::UserLeft { participant_name: "a".into() }.name(), "user-left");
        assert_eq!(RoomEvent::DrawerChanged { drawer_id: "a".into() }.name(), "drawer-changed");
        assert_eq!(RoomEvent::WhiteboardUpdate(frame).name(), "whiteboard-update");
        assert_eq!(
            RoomEvent::RequestCanvasState { room_id: "r".into() }.name(),
            "request-canvas-state"
        );
        assert_eq!(RoomEvent::ResyncRequired { room_id: "r".into() }.name(), "resync-required");
    }

    #[test]
    fn test_inbound_room_id() {
        let ev = InboundEvent::WhiteboardUpdate(CanvasFrame::new("room0001", vec![1], 2, 3));
        assert_eq!(ev.room_id(), "room0001");
        let ev = InboundEvent::JoinChannel { room_id: "room0002".into(), participant_id: None };
        assert_eq!(ev.room_id(), "room0002");
    }

    #[test]
    fn test_client_frame_roundtrip() {
        let frame = ClientFrame::Request {
            request_id: 7,
            request: Request::GrantDrawer {
                room_id: "room0001".into(),
                requested_by: "alice".into(),
                target_identity: "guest2".into(),
            },
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(ClientFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_server_error_response_roundtrip() {
        let frame = ServerFrame::Response {
            request_id: 3,
            result: Err(WireError {
                kind: ErrorKind::PermissionDenied,
                message: "only the owner may grant".into(),
            }),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(ServerFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_whiteboard_event_keeps_payload() {
        let data = vec![0xAB; 64 * 1024];
        let frame = ServerFrame::Event {
            room_id: "room0001".into(),
            event: RoomEvent::WhiteboardUpdate(CanvasFrame::new("room0001", data.clone(), 800, 600)),
        };
        let bytes = frame.encode().unwrap();
        // Length prefix plus a handful of small fields
        assert!(bytes.len() < data.len() + 64);

        match ServerFrame::decode(&bytes).unwrap() {
            ServerFrame::Event { event: RoomEvent::WhiteboardUpdate(f), .. } => {
                assert_eq!(f.data, data);
                assert_eq!((f.width, f.height), (800, 600));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(matches!(
            ClientFrame::decode(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ServerFrame::decode(&[]).is_err());
    }

    #[test]
    fn test_request_names_are_distinct() {
        let requests = [
            Request::CreateRoom { owner_identity: None },
            Request::SessionInfo { room_id: "r".into() },
            Request::LoadSnapshot { room_id: "r".into() },
            Request::ListSaved { identity: "a".into() },
        ];
        let mut names: Vec<&str> = requests.iter().map(Request::name).collect();
        names.dedup();
        assert_eq!(names.len(), requests.len());
    }

    #[test]
    fn test_canvas_frame_to_snapshot() {
        let frame = CanvasFrame::new("room0001", b"data".to_vec(), 640, 480);
        let snap = frame.to_snapshot();
        assert_eq!(snap.data, b"data");
        assert_eq!((snap.width, snap.height), (640, 480));
    }
}
