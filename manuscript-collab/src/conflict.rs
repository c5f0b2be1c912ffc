//! Conflict records for edits whose target vanished under concurrent deletes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConflictId, ManuscriptId, SessionId, UserId};
use crate::operation::{CollaborativeEdit, EditOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The whole range a delete/replace targeted was removed by intervening deletes.
    TargetRemoved,
}

/// An edit that was not applied, kept until its submitter resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub id: ConflictId,
    pub manuscript_id: ManuscriptId,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub operation: EditOperation,
    pub base_version: u64,
    pub server_version: u64,
    pub competing: Vec<CollaborativeEdit>,
    pub reason: ConflictReason,
    pub detected_at: DateTime<Utc>,
    /// Operation the submitter chose in the end. `None` means the edit was abandoned.
    pub adopted: Option<EditOperation>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictResolution {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manuscript_id: ManuscriptId,
        session_id: SessionId,
        user_id: UserId,
        operation: EditOperation,
        base_version: u64,
        server_version: u64,
        competing: Vec<CollaborativeEdit>,
        reason: ConflictReason,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            manuscript_id,
            session_id,
            user_id,
            operation,
            base_version,
            server_version,
            competing,
            reason,
            detected_at: Utc::now(),
            adopted: None,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn resolve(&mut self, adopted: Option<EditOperation>) {
        self.adopted = adopted;
        self.resolved_at = Some(Utc::now());
    }
}
