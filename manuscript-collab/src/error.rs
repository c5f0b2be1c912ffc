//! Error taxonomy for the collaboration core.
//!
//! Every variant maps onto a wire [`ErrorCode`] so the server can answer the
//! originating connection with a structured `error` message.

use thiserror::Error;

use crate::ids::{CommentId, ConflictId, ManuscriptId, SessionId};
use crate::protocol::{ErrorCode, ProtocolError};
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Unknown session: {0}")]
    InvalidSession(SessionId),

    #[error("Unknown manuscript: {0}")]
    InvalidManuscript(ManuscriptId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error(
        "Operation out of bounds: range {}..{} exceeds content length {}",
        .position,
        range_end(.position, .length),
        .content_len
    )]
    OutOfBounds {
        position: usize,
        length: usize,
        content_len: usize,
    },

    #[error("Client at version {client_version} cannot be transformed to {server_version}; resync required")]
    ResyncRequired {
        client_version: u64,
        server_version: u64,
    },

    #[error("Manuscript {0} has reached its session limit")]
    SessionLimit(ManuscriptId),

    #[error("Comment not found: {0}")]
    CommentNotFound(CommentId),

    #[error("No snapshot at version {0}")]
    SnapshotNotFound(u64),

    #[error("Conflict not found or already resolved: {0}")]
    ConflictNotFound(ConflictId),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, CollabError>;

impl CollabError {
    /// Wire code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSession(_) => ErrorCode::InvalidSession,
            Self::InvalidManuscript(_) => ErrorCode::InvalidManuscript,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            Self::ResyncRequired { .. } => ErrorCode::ResyncRequired,
            Self::SessionLimit(_) => ErrorCode::SessionLimit,
            Self::CommentNotFound(_) | Self::SnapshotNotFound(_) | Self::ConflictNotFound(_) => {
                ErrorCode::NotFound
            }
            Self::PersistenceFailure(_) => ErrorCode::PersistenceFailure,
            Self::Protocol(_) => ErrorCode::Protocol,
        }
    }

    /// Transient failures the client may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceFailure(_) | Self::SessionLimit(_))
    }

    /// Failures after which the client must pull a fresh `sync` state.
    pub fn requires_resync(&self) -> bool {
        matches!(self, Self::OutOfBounds { .. } | Self::ResyncRequired { .. })
    }
}

fn range_end(position: &usize, length: &usize) -> usize {
    position.saturating_add(*length)
}
