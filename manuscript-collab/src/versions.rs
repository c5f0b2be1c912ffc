//! Immutable version snapshots and diffs between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::diff::{self, Difference, DifferenceKind};
use crate::document::Document;
use crate::error::{CollabError, Result};
use crate::ids::{ManuscriptId, UserId};
use crate::operation::CollaborativeEdit;

/// Author recorded on snapshots the server takes on its own.
pub const SYSTEM_AUTHOR: &str = "system";

/// Full content at one version plus the edits since the parent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub manuscript_id: ManuscriptId,
    pub version: u64,
    pub content: String,
    pub changes: Vec<CollaborativeEdit>,
    pub author_id: UserId,
    pub description: Option<String>,
    pub parent_version: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl VersionSnapshot {
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            version: self.version,
            author_id: self.author_id.clone(),
            description: self.description.clone(),
            parent_version: self.parent_version,
            change_count: self.changes.len(),
            content_length: self.content.chars().count(),
            created_at: self.created_at,
        }
    }
}

/// Listing entry for a snapshot, without content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version: u64,
    pub author_id: UserId,
    pub description: Option<String>,
    pub parent_version: Option<u64>,
    pub change_count: usize,
    pub content_length: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub insertions: usize,
    pub deletions: usize,
    pub modifications: usize,
    pub chars_added: usize,
    pub chars_removed: usize,
}

impl DiffSummary {
    fn from_differences(differences: &[Difference]) -> Self {
        let mut summary = Self::default();
        for d in differences {
            match d.kind {
                DifferenceKind::Insert => summary.insertions += 1,
                DifferenceKind::Delete => summary.deletions += 1,
                DifferenceKind::Modify => summary.modifications += 1,
            }
            summary.chars_added += d.new_length;
            summary.chars_removed += d.old_length;
        }
        summary
    }

    pub fn is_unchanged(&self) -> bool {
        self.insertions + self.deletions + self.modifications == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDiff {
    pub manuscript_id: ManuscriptId,
    pub from_version: u64,
    pub to_version: u64,
    pub differences: Vec<Difference>,
    pub summary: DiffSummary,
}

impl VersionDiff {
    pub fn between(
        manuscript_id: ManuscriptId,
        from_version: u64,
        to_version: u64,
        old: &str,
        new: &str,
    ) -> Self {
        let differences = diff::diff(old, new);
        let summary = DiffSummary::from_differences(&differences);
        Self {
            manuscript_id,
            from_version,
            to_version,
            differences,
            summary,
        }
    }
}

/// Snapshots of one manuscript keyed by version.
#[derive(Debug, Default)]
pub struct VersionHistory {
    snapshots: BTreeMap<u64, Arc<VersionSnapshot>>,
}

impl VersionHistory {
    pub fn new(snapshots: Vec<VersionSnapshot>) -> Self {
        Self {
            snapshots: snapshots
                .into_iter()
                .map(|s| (s.version, Arc::new(s)))
                .collect(),
        }
    }

    pub fn get(&self, version: u64) -> Option<Arc<VersionSnapshot>> {
        self.snapshots.get(&version).cloned()
    }

    pub fn latest(&self) -> Option<Arc<VersionSnapshot>> {
        self.snapshots.values().next_back().cloned()
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.snapshots.keys().next_back().copied()
    }

    /// Build a snapshot of the document's current state.
    ///
    /// `changes` are the edits committed since the latest snapshot.
    pub fn capture(
        &self,
        document: &Document,
        changes: Vec<CollaborativeEdit>,
        author_id: UserId,
        description: Option<String>,
    ) -> VersionSnapshot {
        VersionSnapshot {
            manuscript_id: document.manuscript_id().clone(),
            version: document.version(),
            content: document.content().to_string(),
            changes,
            author_id,
            description,
            parent_version: self.latest_version(),
            created_at: Utc::now(),
        }
    }

    /// Store a snapshot. An existing snapshot at the same version is kept.
    pub fn record(&mut self, snapshot: VersionSnapshot) -> Arc<VersionSnapshot> {
        self.snapshots
            .entry(snapshot.version)
            .or_insert_with(|| Arc::new(snapshot))
            .clone()
    }

    pub fn summaries(&self) -> Vec<VersionSummary> {
        self.snapshots.values().map(|s| s.summary()).collect()
    }

    /// Diff two versions. Each must be a snapshot, or the document's current version.
    pub fn diff(&self, document: &Document, from: u64, to: u64) -> Result<VersionDiff> {
        let (old, new) = self.contents_for(document, from, to)?;
        Ok(VersionDiff::between(
            document.manuscript_id().clone(),
            from,
            to,
            &old,
            &new,
        ))
    }

    /// Copies of the content at `from` and at `to`, so the diff itself can run
    /// without holding whatever guards the history.
    pub fn contents_for(
        &self,
        document: &Document,
        from: u64,
        to: u64,
    ) -> Result<(String, String)> {
        Ok((self.content_at(document, from)?, self.content_at(document, to)?))
    }

    fn content_at(&self, document: &Document, version: u64) -> Result<String> {
        if let Some(snapshot) = self.snapshots.get(&version) {
            return Ok(snapshot.content.clone());
        }
        if version == document.version() {
            return Ok(document.content().to_string());
        }
        Err(CollabError::SnapshotNotFound(version))
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::EditOperation;

    fn doc(text: &str) -> Document {
        Document::new(ManuscriptId::new("ms"), text, 0)
    }

    #[test]
    fn test_capture_links_parent() {
        let mut history = VersionHistory::default();
        let mut d = doc("draft");
        let first = history.record(history.capture(&d, Vec::new(), UserId::new("a"), None));
        assert_eq!(first.parent_version, None);

        d.apply(&EditOperation::insert(5, " two")).unwrap();
        let second = history.record(history.capture(
            &d,
            Vec::new(),
            UserId::new("a"),
            Some("second pass".into()),
        ));
        assert_eq!(second.parent_version, Some(0));
        assert_eq!(second.content, "draft two");
        assert_eq!(history.latest_version(), Some(1));
    }

    #[test]
    fn test_record_keeps_existing_snapshot() {
        let mut history = VersionHistory::default();
        let d = doc("text");
        let first = history.record(history.capture(&d, Vec::new(), UserId::new("a"), Some("one".into())));
        let again = history.record(history.capture(&d, Vec::new(), UserId::new("b"), Some("two".into())));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.description.as_deref(), Some("one"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_diff_with_itself_is_empty() {
        let mut history = VersionHistory::default();
        let d = doc("unchanged");
        history.record(history.capture(&d, Vec::new(), UserId::new("a"), None));
        let diff = history.diff(&d, 0, 0).unwrap();
        assert!(diff.differences.is_empty());
        assert!(diff.summary.is_unchanged());
    }

    #[test]
    fn test_diff_against_current_version() {
        let mut history = VersionHistory::default();
        let mut d = doc("The cat sat");
        history.record(history.capture(&d, Vec::new(), UserId::new("a"), None));
        d.apply(&EditOperation::replace(4, 3, "dog")).unwrap();

        let diff = history.diff(&d, 0, 1).unwrap();
        assert_eq!(diff.summary.modifications, 1);
        assert_eq!(diff.summary.chars_added, 3);
        assert_eq!(diff.summary.chars_removed, 3);
    }

    #[test]
    fn test_diff_unknown_version() {
        let history = VersionHistory::default();
        let d = doc("x");
        assert!(matches!(
            history.diff(&d, 7, 0),
            Err(CollabError::SnapshotNotFound(7))
        ));
    }
}
