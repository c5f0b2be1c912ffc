//! Persistent storage for manuscripts, edits, snapshots and comments.
//!
//! ```text
//! ┌──────────────┐  persist_edit(s)   ┌───────────────────────────────┐
//! │ CollabService│ ─────────────────► │ dyn DocumentStore             │
//! │ (rooms)      │  persist_snapshot  │  ├── MemoryStore (in-process) │
//! └──────┬───────┘  persist_comment   │  └── RocksStore  (RocksDB)    │
//!        │                            └───────────────┬───────────────┘
//!        │ load_document on first join                │
//!        ▼                                            ▼
//! ┌──────────────┐                     base content @ base version
//! │ Document     │ ◄── replay ──────── + edits (base, head]
//! └──────────────┘
//! ```
//!
//! Every write happens before the matching in-memory mutation, so a failed
//! write leaves the live document untouched.

pub mod memory;
pub mod rocks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comments::Comment;
use crate::document::Document;
use crate::ids::ManuscriptId;
use crate::operation::CollaborativeEdit;
use crate::versions::VersionSnapshot;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Manuscript not found: {0}")]
    NotFound(ManuscriptId),

    #[error("Manuscript already exists: {0}")]
    AlreadyExists(ManuscriptId),

    #[error("Edit v{got} does not follow stored v{expected} for {manuscript_id}")]
    VersionMismatch {
        manuscript_id: ManuscriptId,
        expected: u64,
        got: u64,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Current state of a manuscript as reconstructed from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredManuscript {
    pub manuscript_id: ManuscriptId,
    pub content: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Listing entry for a stored manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManuscriptMeta {
    pub manuscript_id: ManuscriptId,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backing store for manuscripts.
///
/// Calls are synchronous and short; callers hold the manuscript lock across
/// them so that edits reach the store in version order.
pub trait DocumentStore: Send + Sync {
    fn load_document(&self, id: &ManuscriptId) -> Result<StoredManuscript, StoreError>;

    fn create_document(&self, id: &ManuscriptId, content: &str)
        -> Result<StoredManuscript, StoreError>;

    /// Append one committed edit. `edit.version` must follow the stored head.
    fn persist_edit(&self, edit: &CollaborativeEdit) -> Result<(), StoreError>;

    /// Append several consecutive edits. Either all are stored or none.
    fn persist_edits(&self, edits: &[CollaborativeEdit]) -> Result<(), StoreError> {
        for edit in edits {
            self.persist_edit(edit)?;
        }
        Ok(())
    }

    /// Append edits together with the comments whose anchors they moved.
    /// Either all are stored or none.
    fn persist_commit(
        &self,
        edits: &[CollaborativeEdit],
        comments: &[Comment],
    ) -> Result<(), StoreError> {
        self.persist_edits(edits)?;
        for comment in comments {
            self.persist_comment(comment)?;
        }
        Ok(())
    }

    /// Store a snapshot and fold the edits it covers into the base content.
    fn persist_snapshot(&self, snapshot: &VersionSnapshot) -> Result<(), StoreError>;

    fn persist_comment(&self, comment: &Comment) -> Result<(), StoreError>;

    fn load_comments(&self, id: &ManuscriptId) -> Result<Vec<Comment>, StoreError>;

    fn load_snapshots(&self, id: &ManuscriptId) -> Result<Vec<VersionSnapshot>, StoreError>;

    fn list_documents(&self) -> Result<Vec<ManuscriptMeta>, StoreError>;
}

/// Rebuild current content from a base and the edits stored after it.
pub(crate) fn replay_stored(
    manuscript_id: &ManuscriptId,
    base_content: String,
    base_version: u64,
    edits: &[CollaborativeEdit],
) -> Result<(String, u64), StoreError> {
    let document = Document::new(manuscript_id.clone(), base_content, base_version)
        .replay(edits)
        .map_err(|e| StoreError::Corrupt(format!("replaying {manuscript_id}: {e}")))?;
    Ok((document.content().to_string(), document.version()))
}

pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SessionId, UserId};
    use crate::operation::EditOperation;

    #[test]
    fn test_replay_stored_applies_edits_in_order() {
        let id = ManuscriptId::new("ms");
        let edits = vec![
            CollaborativeEdit::new(
                id.clone(),
                SessionId::new(),
                UserId::new("a"),
                EditOperation::insert(5, "!"),
                4,
                5,
            ),
            CollaborativeEdit::new(
                id.clone(),
                SessionId::new(),
                UserId::new("a"),
                EditOperation::delete(0, 1),
                5,
                6,
            ),
        ];
        let (content, version) = replay_stored(&id, "Hello".into(), 4, &edits).unwrap();
        assert_eq!(content, "ello!");
        assert_eq!(version, 6);
    }

    #[test]
    fn test_replay_stored_reports_corruption() {
        let id = ManuscriptId::new("ms");
        let edits = vec![CollaborativeEdit::new(
            id.clone(),
            SessionId::new(),
            UserId::new("a"),
            EditOperation::delete(0, 10),
            0,
            1,
        )];
        assert!(matches!(
            replay_stored(&id, "short".into(), 0, &edits),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_record_codec() {
        let edit = CollaborativeEdit::new(
            ManuscriptId::new("ms"),
            SessionId::new(),
            UserId::new("a"),
            EditOperation::insert(0, "naïve"),
            0,
            1,
        );
        let bytes = encode_record(&edit).unwrap();
        let decoded: CollaborativeEdit = decode_record(&bytes).unwrap();
        assert_eq!(decoded, edit);
    }
}
