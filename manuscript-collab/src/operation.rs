//! Edit operations and the append-only edit log entry.
//!
//! Positions and lengths count `char`s of the manuscript text, never bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CollabError, Result};
use crate::ids::{ManuscriptId, SessionId, UserId};

/// Kind of change carried by an [`EditOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
    Format,
}

/// A single positional change. Never mutated after creation; transforming an
/// operation always produces a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    pub kind: OperationKind,
    pub position: usize,
    /// Inserted text (insert / replace).
    #[serde(default)]
    pub content: String,
    /// Affected range length (delete / replace / format).
    #[serde(default)]
    pub length: usize,
    /// Formatting attributes (format only). Opaque to this layer.
    #[serde(default)]
    pub attributes: Option<BTreeMap<String, String>>,
    /// Manuscript section the edit was made in, if the client tracks one.
    #[serde(default)]
    pub section: Option<String>,
}

impl EditOperation {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Insert,
            position,
            content: content.into(),
            length: 0,
            attributes: None,
            section: None,
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            kind: OperationKind::Delete,
            position,
            content: String::new(),
            length,
            attributes: None,
            section: None,
        }
    }

    pub fn replace(position: usize, length: usize, content: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Replace,
            position,
            content: content.into(),
            length,
            attributes: None,
            section: None,
        }
    }

    pub fn format(position: usize, length: usize, attributes: BTreeMap<String, String>) -> Self {
        Self {
            kind: OperationKind::Format,
            position,
            content: String::new(),
            length,
            attributes: Some(attributes),
            section: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Number of chars this operation inserts.
    pub fn inserted_len(&self) -> usize {
        match self.kind {
            OperationKind::Insert | OperationKind::Replace => self.content.chars().count(),
            OperationKind::Delete | OperationKind::Format => 0,
        }
    }

    /// Number of chars this operation removes.
    pub fn removed_len(&self) -> usize {
        match self.kind {
            OperationKind::Delete | OperationKind::Replace => self.length,
            OperationKind::Insert | OperationKind::Format => 0,
        }
    }

    /// End of the range the operation targets in the pre-edit text.
    pub fn end(&self) -> usize {
        match self.kind {
            OperationKind::Insert => self.position,
            _ => self.position.saturating_add(self.length),
        }
    }

    /// Whether this op removes text, i.e. can lose its target to a concurrent delete.
    pub fn is_destructive(&self) -> bool {
        matches!(self.kind, OperationKind::Delete | OperationKind::Replace)
    }

    /// Shape check, independent of any document.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            OperationKind::Insert => {
                if self.content.is_empty() {
                    return Err(CollabError::InvalidOperation(
                        "insert requires non-empty content".into(),
                    ));
                }
            }
            OperationKind::Delete => {
                if self.length == 0 {
                    return Err(CollabError::InvalidOperation(
                        "delete requires a positive length".into(),
                    ));
                }
                if !self.content.is_empty() {
                    return Err(CollabError::InvalidOperation(
                        "delete must not carry content".into(),
                    ));
                }
            }
            OperationKind::Replace => {
                if self.length == 0 {
                    return Err(CollabError::InvalidOperation(
                        "replace requires a positive length".into(),
                    ));
                }
            }
            OperationKind::Format => {
                if self.length == 0 {
                    return Err(CollabError::InvalidOperation(
                        "format requires a positive length".into(),
                    ));
                }
                if !self.content.is_empty() {
                    return Err(CollabError::InvalidOperation(
                        "format must not carry content".into(),
                    ));
                }
            }
        }
        if self.position.checked_add(self.length).is_none() {
            return Err(CollabError::InvalidOperation("range overflows".into()));
        }
        Ok(())
    }
}

/// Committed log entry: an operation bound to its author and the version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborativeEdit {
    pub manuscript_id: ManuscriptId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub operation: EditOperation,
    /// Version the client had seen when it submitted the edit.
    pub base_version: u64,
    /// Version this edit produced.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub applied: bool,
}

impl CollaborativeEdit {
    pub fn new(
        manuscript_id: ManuscriptId,
        session_id: SessionId,
        user_id: UserId,
        operation: EditOperation,
        base_version: u64,
        version: u64,
    ) -> Self {
        Self {
            manuscript_id,
            session_id,
            user_id,
            operation,
            base_version,
            version,
            timestamp: Utc::now(),
            applied: false,
        }
    }
}
