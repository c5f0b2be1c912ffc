//! In-process store. Used when no storage path is configured and in tests.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    replay_stored, DocumentStore, ManuscriptMeta, StoreError, StoredManuscript,
};
use crate::comments::Comment;
use crate::ids::{CommentId, ManuscriptId};
use crate::operation::CollaborativeEdit;
use crate::versions::VersionSnapshot;

#[derive(Debug)]
struct Entry {
    base_content: String,
    base_version: u64,
    edits: Vec<CollaborativeEdit>,
    snapshots: BTreeMap<u64, VersionSnapshot>,
    comments: HashMap<CommentId, Comment>,
    meta: ManuscriptMeta,
}

impl Entry {
    fn head_version(&self) -> u64 {
        self.base_version + self.edits.len() as u64
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<ManuscriptId, Entry>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `Unavailable` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write failure injected".into()));
        }
        Ok(())
    }

    /// Number of edits held after the base content.
    pub fn pending_edits(&self, id: &ManuscriptId) -> usize {
        self.entries.lock().get(id).map_or(0, |e| e.edits.len())
    }

    /// Edits held after the base content, as stored.
    pub fn stored_edits(&self, id: &ManuscriptId) -> Vec<CollaborativeEdit> {
        self.entries.lock().get(id).map_or_else(Vec::new, |e| e.edits.clone())
    }
}

impl DocumentStore for MemoryStore {
    fn load_document(&self, id: &ManuscriptId) -> Result<StoredManuscript, StoreError> {
        let entries = self.entries.lock();
        let entry = entries.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let (content, version) =
            replay_stored(id, entry.base_content.clone(), entry.base_version, &entry.edits)?;
        Ok(StoredManuscript {
            manuscript_id: id.clone(),
            content,
            version,
            created_at: entry.meta.created_at,
        })
    }

    fn create_document(
        &self,
        id: &ManuscriptId,
        content: &str,
    ) -> Result<StoredManuscript, StoreError> {
        self.check_writable()?;
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.clone()));
        }
        let now = Utc::now();
        entries.insert(
            id.clone(),
            Entry {
                base_content: content.to_string(),
                base_version: 0,
                edits: Vec::new(),
                snapshots: BTreeMap::new(),
                comments: HashMap::new(),
                meta: ManuscriptMeta {
                    manuscript_id: id.clone(),
                    version: 0,
                    created_at: now,
                    updated_at: now,
                },
            },
        );
        Ok(StoredManuscript {
            manuscript_id: id.clone(),
            content: content.to_string(),
            version: 0,
            created_at: now,
        })
    }

    fn persist_edit(&self, edit: &CollaborativeEdit) -> Result<(), StoreError> {
        self.persist_edits(std::slice::from_ref(edit))
    }

    fn persist_edits(&self, edits: &[CollaborativeEdit]) -> Result<(), StoreError> {
        self.persist_commit(edits, &[])
    }

    fn persist_commit(
        &self,
        edits: &[CollaborativeEdit],
        comments: &[Comment],
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut entries = self.entries.lock();
        for comment in comments {
            if !entries.contains_key(&comment.manuscript_id) {
                return Err(StoreError::NotFound(comment.manuscript_id.clone()));
            }
        }

        if let Some(first) = edits.first() {
            let entry = entries
                .get_mut(&first.manuscript_id)
                .ok_or_else(|| StoreError::NotFound(first.manuscript_id.clone()))?;
            let mut expected = entry.head_version() + 1;
            for edit in edits {
                if edit.version != expected {
                    return Err(StoreError::VersionMismatch {
                        manuscript_id: edit.manuscript_id.clone(),
                        expected,
                        got: edit.version,
                    });
                }
                expected += 1;
            }
            entry.edits.extend_from_slice(edits);
            entry.meta.version = entry.head_version();
            entry.meta.updated_at = Utc::now();
        }

        for comment in comments {
            if let Some(entry) = entries.get_mut(&comment.manuscript_id) {
                entry.comments.insert(comment.id, comment.clone());
            }
        }
        Ok(())
    }

    fn persist_snapshot(&self, snapshot: &VersionSnapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&snapshot.manuscript_id)
            .ok_or_else(|| StoreError::NotFound(snapshot.manuscript_id.clone()))?;

        entry
            .snapshots
            .entry(snapshot.version)
            .or_insert_with(|| snapshot.clone());

        if snapshot.version > entry.base_version && snapshot.version <= entry.head_version() {
            let covered = (snapshot.version - entry.base_version) as usize;
            entry.edits.drain(..covered);
            entry.base_content = snapshot.content.clone();
            entry.base_version = snapshot.version;
        }
        Ok(())
    }

    fn persist_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&comment.manuscript_id)
            .ok_or_else(|| StoreError::NotFound(comment.manuscript_id.clone()))?;
        entry.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    fn load_comments(&self, id: &ManuscriptId) -> Result<Vec<Comment>, StoreError> {
        let entries = self.entries.lock();
        let entry = entries.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(entry.comments.values().cloned().collect())
    }

    fn load_snapshots(&self, id: &ManuscriptId) -> Result<Vec<VersionSnapshot>, StoreError> {
        let entries = self.entries.lock();
        let entry = entries.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(entry.snapshots.values().cloned().collect())
    }

    fn list_documents(&self) -> Result<Vec<ManuscriptMeta>, StoreError> {
        let mut metas: Vec<ManuscriptMeta> =
            self.entries.lock().values().map(|e| e.meta.clone()).collect();
        metas.sort_by(|a, b| a.manuscript_id.cmp(&b.manuscript_id));
        Ok(metas)
    }
}
