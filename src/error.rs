use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried by the wire `error` message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolError,
    NotJoined,
    AlreadyJoined,
    InvalidOperation,
    VersionConflict,
    AuthorizationDenied,
    StorageUnavailable,
    RoomUnavailable,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::NotJoined => "not_joined",
            ErrorCode::AlreadyJoined => "already_joined",
            ErrorCode::InvalidOperation => "invalid_operation",
            ErrorCode::VersionConflict => "version_conflict",
            ErrorCode::AuthorizationDenied => "authorization_denied",
            ErrorCode::StorageUnavailable => "storage_unavailable",
            ErrorCode::RoomUnavailable => "room_unavailable",
            ErrorCode::InternalError => "internal_error",
        };
        write!(f, "{}", code)
    }
}

/// Everything that can go wrong inside the sync engine.
///
/// None of these are fatal to the process. The worst case, `RoomFailed`, ends a
/// single room and its sessions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Malformed or unexpected message. Only that message is rejected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation was authored against history that has been compacted away.
    #[error("operation authored at version {authored} predates retained history (base version {base})")]
    VersionConflict { authored: u64, base: u64 },

    /// Well-formed message carrying an operation that cannot be applied.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The participant's connection dropped; the session is held for the grace period.
    #[error("participant connection lost")]
    TransientDisconnect,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The room shut down between lookup and delivery. The caller may retry with a fresh lookup.
    #[error("room closed")]
    RoomClosed,

    #[error("room failed: {0}")]
    RoomFailed(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Protocol(_) => ErrorCode::ProtocolError,
            SyncError::VersionConflict { .. } => ErrorCode::VersionConflict,
            SyncError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            SyncError::AuthorizationDenied(_) => ErrorCode::AuthorizationDenied,
            SyncError::TransientDisconnect => ErrorCode::InternalError,
            SyncError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            SyncError::RoomClosed | SyncError::RoomFailed(_) => ErrorCode::RoomUnavailable,
        }
    }
}
