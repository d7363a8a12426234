//! Error taxonomy for the session core.
//!
//! Every fallible coordinator operation returns [`SessionError`]. Storage and
//! wire failures keep their own error types ([`StoreError`],
//! [`ProtocolError`](crate::protocol::ProtocolError)) and are wrapped here when
//! they cross into session logic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::room::RoomId;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Room absent. Callers surface this as a 404-equivalent, never as fatal.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Non-owner grant, or a mutation reserved to another identity.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Missing or malformed input, rejected before any state is touched.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Room identifier generation kept colliding.
    #[error("Could not allocate a unique room id after {0} attempts")]
    Conflict(usize),

    /// Broadcast or socket delivery failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Snapshot or room record could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::Transport(err.to_string())
    }
}

/// Error category carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Validation,
    Conflict,
    Transport,
    Persistence,
}

/// Serializable form of a [`SessionError`] sent back to a requesting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SessionError> for WireError {
    fn from(err: &SessionError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<SessionError> for WireError {
    fn from(err: SessionError) -> Self {
        Self::from(&err)
    }
}

impl From<WireError> for SessionError {
    /// Rebuild a local error from a remote one. The original payload (room id,
    /// store error) is not recoverable, so the message is kept verbatim.
    fn from(err: WireError) -> Self {
        match err.kind {
            ErrorKind::NotFound => SessionError::RoomNotFound(err.message),
            ErrorKind::PermissionDenied => SessionError::PermissionDenied(err.message),
            ErrorKind::Validation => SessionError::Validation(err.message),
            ErrorKind::Conflict => SessionError::Conflict(0),
            ErrorKind::Transport => SessionError::Transport(err.message),
            ErrorKind::Persistence => {
                SessionError::Persistence(StoreError::Database(err.message))
            }
        }
    }
}
