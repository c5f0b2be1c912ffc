//! Authoritative manuscript text, its version counter, and the append-only
//! edit log.
//!
//! [`Document::apply`] is the only way content changes. It is crate-private:
//! callers go through the manuscript room, which holds the per-manuscript
//! lock while transforming and applying.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{CollabError, Result};
use crate::ids::ManuscriptId;
use crate::operation::{CollaborativeEdit, EditOperation, OperationKind};

/// Manuscript content plus its monotonically increasing version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    manuscript_id: ManuscriptId,
    content: String,
    /// Cached `content.chars().count()`.
    char_len: usize,
    version: u64,
}

impl Document {
    pub fn new(manuscript_id: ManuscriptId, content: impl Into<String>, version: u64) -> Self {
        let content = content.into();
        let char_len = content.chars().count();
        Self {
            manuscript_id,
            content,
            char_len,
            version,
        }
    }

    pub fn manuscript_id(&self) -> &ManuscriptId {
        &self.manuscript_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.char_len
    }

    pub fn is_empty(&self) -> bool {
        self.char_len == 0
    }

    /// Reject an operation that reaches outside the current content.
    pub fn check_bounds(&self, op: &EditOperation) -> Result<()> {
        let end = match op.kind {
            OperationKind::Insert => op.position,
            _ => op.position.saturating_add(op.length),
        };
        if op.position > self.char_len || end > self.char_len {
            return Err(CollabError::OutOfBounds {
                position: op.position,
                length: op.length,
                content_len: self.char_len,
            });
        }
        Ok(())
    }

    /// Apply a transformed operation and bump the version by exactly one.
    ///
    /// Fails without touching the content when the op is out of bounds.
    pub(crate) fn apply(&mut self, op: &EditOperation) -> Result<u64> {
        self.check_bounds(op)?;

        let start = self.byte_offset(op.position);
        match op.kind {
            OperationKind::Insert => {
                self.content.insert_str(start, &op.content);
            }
            OperationKind::Delete => {
                let end = self.byte_offset(op.position + op.length);
                self.content.replace_range(start..end, "");
            }
            OperationKind::Replace => {
                let end = self.byte_offset(op.position + op.length);
                self.content.replace_range(start..end, &op.content);
            }
            OperationKind::Format => {}
        }
        self.char_len = self.char_len + op.inserted_len() - op.removed_len();
        self.version += 1;
        Ok(self.version)
    }

    /// Rebuild a document by applying committed edits in order.
    ///
    /// Each edit must carry the version following the previous one.
    pub fn replay<'a, I>(mut self, edits: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a CollaborativeEdit>,
    {
        for edit in edits {
            if edit.version != self.version + 1 {
                return Err(CollabError::InvalidOperation(format!(
                    "replay gap: document at v{}, next edit is v{}",
                    self.version, edit.version
                )));
            }
            self.apply(&edit.operation)?;
        }
        Ok(self)
    }

    fn byte_offset(&self, char_pos: usize) -> usize {
        if char_pos >= self.char_len {
            return self.content.len();
        }
        self.content
            .char_indices()
            .nth(char_pos)
            .map(|(i, _)| i)
            .unwrap_or(self.content.len())
    }
}

/// Append-only log of committed edits for one manuscript.
///
/// Entries are immutable once appended, so readers only take the read lock
/// long enough to clone the `Arc`s they need; the manuscript lock is not
/// required to read history.
#[derive(Debug)]
pub struct EditLog {
    /// Version of the document before the first entry held in memory.
    base_version: u64,
    entries: RwLock<Vec<Arc<CollaborativeEdit>>>,
}

impl EditLog {
    pub fn new(base_version: u64) -> Self {
        Self {
            base_version,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub(crate) fn append(&self, edit: CollaborativeEdit) -> Arc<CollaborativeEdit> {
        let edit = Arc::new(edit);
        self.entries.write().push(edit.clone());
        edit
    }

    /// Edits with version in `(after, up_to]`, in version order.
    ///
    /// Returns `None` when part of that range predates what is held in memory.
    pub fn between(&self, after: u64, up_to: u64) -> Option<Vec<Arc<CollaborativeEdit>>> {
        if after < self.base_version {
            return None;
        }
        let entries = self.entries.read();
        let from = (after - self.base_version) as usize;
        let to = (up_to.saturating_sub(self.base_version) as usize).min(entries.len());
        if from > to {
            return Some(Vec::new());
        }
        Some(entries[from..to].to_vec())
    }

    /// Edits with version greater than `after`.
    pub fn since(&self, after: u64) -> Vec<Arc<CollaborativeEdit>> {
        let entries = self.entries.read();
        let from = after.saturating_sub(self.base_version) as usize;
        entries.get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn head_version(&self) -> u64 {
        self.base_version + self.len() as u64
    }
}

/// The mutation path: apply one transformed op and log it.
///
/// `edit.version` must be the document's next version. The entry is appended
/// to the log before the new version is returned.
pub(crate) fn commit(
    document: &mut Document,
    log: &EditLog,
    mut edit: CollaborativeEdit,
) -> Result<Arc<CollaborativeEdit>> {
    debug_assert_eq!(edit.version, document.version() + 1);
    let version = document.apply(&edit.operation)?;
    edit.version = version;
    edit.applied = true;
    Ok(log.append(edit))
}
