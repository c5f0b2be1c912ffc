//! Per-manuscript state and the critical sections that change it.
//!
//! ```text
//!  RoomManager ── ManuscriptId ──► ManuscriptRoom
//!                                   ├── state: Mutex<RoomState>   (one writer at a time)
//!                                   │     ├── Document            (content + version)
//!                                   │     ├── CommentBook
//!                                   │     ├── VersionHistory
//!                                   │     └── pending conflicts
//!                                   └── log: EditLog              (readable without the lock)
//! ```
//!
//! An edit is validated, transformed, bounds-checked, persisted and only then
//! applied, all while holding the room lock. Comment anchors move in the same
//! section and are stored in the same write as the edits. Broadcasting is the
//! caller's job once the lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::comments::{Comment, CommentBook, CommentStatus, CommentThread};
use crate::conflict::{ConflictReason, ConflictResolution};
use crate::document::{commit, Document, EditLog};
use crate::error::{CollabError, Result};
use crate::ids::{CommentId, ConflictId, ManuscriptId, SessionId, UserId};
use crate::operation::{CollaborativeEdit, EditOperation};
use crate::protocol::SyncState;
use crate::session::{Session, SessionInfo};
use crate::storage::{DocumentStore, StoreError};
use crate::transform::{transform, TransformOutcome};
use crate::versions::{VersionDiff, VersionHistory, VersionSnapshot, VersionSummary, SYSTEM_AUTHOR};

/// Limits applied to every edit.
#[derive(Debug, Clone, Copy)]
pub struct EditPolicy {
    pub max_transform_distance: u64,
    /// 0 disables automatic snapshots.
    pub auto_snapshot_interval: u64,
}

/// Who submitted an edit or comment.
#[derive(Debug, Clone)]
pub struct Author {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub user_name: String,
}

impl From<&Session> for Author {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id,
            user_id: session.user_id.clone(),
            user_name: session.user_name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EditOutcome {
    Applied {
        edits: Vec<Arc<CollaborativeEdit>>,
        version: u64,
        /// Set when this edit triggered an automatic snapshot.
        snapshot: Option<Arc<VersionSnapshot>>,
    },
    Conflict(ConflictResolution),
}

struct RoomState {
    document: Document,
    comments: CommentBook,
    versions: VersionHistory,
    conflicts: HashMap<ConflictId, ConflictResolution>,
    edits_since_snapshot: u64,
}

/// Sessions pinning a room, and since when it has had none.
#[derive(Debug)]
struct Occupancy {
    pins: usize,
    empty_since: Option<Instant>,
}

pub struct ManuscriptRoom {
    manuscript_id: ManuscriptId,
    state: Mutex<RoomState>,
    log: EditLog,
    occupancy: parking_lot::Mutex<Occupancy>,
}

impl ManuscriptRoom {
    /// Load a manuscript with its comments and snapshots from the store.
    pub fn load(store: &dyn DocumentStore, manuscript_id: &ManuscriptId) -> Result<Self> {
        let stored = store.load_document(manuscript_id).map_err(|e| match e {
            StoreError::NotFound(id) => CollabError::InvalidManuscript(id),
            other => CollabError::PersistenceFailure(other),
        })?;
        let comments = store.load_comments(manuscript_id)?;
        let snapshots = store.load_snapshots(manuscript_id)?;

        let document = Document::new(manuscript_id.clone(), stored.content, stored.version);
        let versions = VersionHistory::new(snapshots);
        let edits_since_snapshot = stored
            .version
            .saturating_sub(versions.latest_version().unwrap_or(0));

        log::info!(
            "Loaded manuscript {manuscript_id} at v{} ({} comments, {} snapshots)",
            stored.version,
            comments.len(),
            versions.len()
        );

        Ok(Self {
            manuscript_id: manuscript_id.clone(),
            log: EditLog::new(stored.version),
            state: Mutex::new(RoomState {
                document,
                comments: CommentBook::new(comments),
                versions,
                conflicts: HashMap::new(),
                edits_since_snapshot,
            }),
            // Nobody has joined yet; reads alone never keep a room loaded.
            occupancy: parking_lot::Mutex::new(Occupancy {
                pins: 0,
                empty_since: Some(Instant::now()),
            }),
        })
    }

    pub fn manuscript_id(&self) -> &ManuscriptId {
        &self.manuscript_id
    }

    /// Committed edits held in memory. Readable without the room lock.
    pub fn log(&self) -> &EditLog {
        &self.log
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.document.version()
    }

    pub async fn content(&self) -> String {
        self.state.lock().await.document.content().to_string()
    }

    pub async fn sync_state(&self, sessions: Vec<SessionInfo>) -> SyncState {
        let state = self.state.lock().await;
        SyncState {
            manuscript_id: self.manuscript_id.clone(),
            content: state.document.content().to_string(),
            version: state.document.version(),
            comments: state.comments.open(),
            sessions,
        }
    }

    /// Transform an edit against everything committed since `base_version` and apply it.
    pub async fn submit_edit(
        &self,
        store: &dyn DocumentStore,
        author: &Author,
        op: EditOperation,
        base_version: u64,
        policy: EditPolicy,
    ) -> Result<EditOutcome> {
        op.validate()?;
        let mut state = self.state.lock().await;
        self.transform_and_apply(&mut state, store, author, op, base_version, policy)
    }

    fn transform_and_apply(
        &self,
        state: &mut RoomState,
        store: &dyn DocumentStore,
        author: &Author,
        op: EditOperation,
        base_version: u64,
        policy: EditPolicy,
    ) -> Result<EditOutcome> {
        let server_version = state.document.version();
        let resync = CollabError::ResyncRequired {
            client_version: base_version,
            server_version,
        };
        if base_version > server_version
            || server_version - base_version > policy.max_transform_distance
        {
            return Err(resync);
        }
        let intervening = self.log.between(base_version, server_version).ok_or(resync)?;

        match transform(op.clone(), author.session_id, base_version, server_version, &intervening) {
            TransformOutcome::Transformed(ops) => {
                self.apply_ops(state, store, author, ops, base_version, policy)
            }
            TransformOutcome::Conflict { competing } => {
                let conflict = ConflictResolution::new(
                    self.manuscript_id.clone(),
                    author.session_id,
                    author.user_id.clone(),
                    op,
                    base_version,
                    server_version,
                    competing,
                    ConflictReason::TargetRemoved,
                );
                log::info!(
                    "Conflict {} on {}: edit from {} at v{base_version} lost its target by v{server_version}",
                    conflict.id,
                    self.manuscript_id,
                    author.user_id
                );
                state.conflicts.insert(conflict.id, conflict.clone());
                Ok(EditOutcome::Conflict(conflict))
            }
        }
    }

    fn apply_ops(
        &self,
        state: &mut RoomState,
        store: &dyn DocumentStore,
        author: &Author,
        ops: Vec<EditOperation>,
        base_version: u64,
        policy: EditPolicy,
    ) -> Result<EditOutcome> {
        // Pieces are disjoint and ordered by descending position, so each one
        // can be checked against the current content up front.
        for op in &ops {
            state.document.check_bounds(op)?;
        }

        let next = state.document.version() + 1;
        let pending: Vec<CollaborativeEdit> = ops
            .iter()
            .enumerate()
            .map(|(i, op)| {
                let mut edit = CollaborativeEdit::new(
                    self.manuscript_id.clone(),
                    author.session_id,
                    author.user_id.clone(),
                    op.clone(),
                    base_version,
                    next + i as u64,
                );
                edit.applied = true;
                edit
            })
            .collect();
        // Edits and the anchors they move are stored together before anything
        // in memory changes.
        let moved = state.comments.draft_anchors(&ops);
        store.persist_commit(&pending, &moved)?;

        let mut committed = Vec::with_capacity(pending.len());
        for edit in pending {
            committed.push(commit(&mut state.document, &self.log, edit)?);
        }
        for comment in moved {
            state.comments.upsert(comment);
        }

        let version = state.document.version();
        state.edits_since_snapshot += committed.len() as u64;
        log::debug!(
            "{} applied {} op(s) to {} -> v{version}",
            author.user_id,
            committed.len(),
            self.manuscript_id
        );

        let mut snapshot = None;
        if policy.auto_snapshot_interval > 0
            && state.edits_since_snapshot >= policy.auto_snapshot_interval
        {
            match self.take_snapshot(
                state,
                store,
                UserId::new(SYSTEM_AUTHOR),
                Some("Automatic snapshot".to_string()),
            ) {
                Ok(s) => snapshot = Some(s),
                Err(e) => log::error!("Automatic snapshot of {} failed: {e}", self.manuscript_id),
            }
        }

        Ok(EditOutcome::Applied {
            edits: committed,
            version,
            snapshot,
        })
    }

    /// Settle a pending conflict, applying `adopted` if the submitter chose one.
    ///
    /// Only the session that received the conflict may resolve it.
    pub async fn resolve_conflict(
        &self,
        store: &dyn DocumentStore,
        author: &Author,
        conflict_id: ConflictId,
        adopted: Option<EditOperation>,
        base_version: u64,
        policy: EditPolicy,
    ) -> Result<(ConflictResolution, Option<EditOutcome>)> {
        if let Some(op) = &adopted {
            op.validate()?;
        }
        let mut state = self.state.lock().await;
        match state.conflicts.get(&conflict_id) {
            Some(c) if c.session_id == author.session_id => {}
            _ => return Err(CollabError::ConflictNotFound(conflict_id)),
        }

        let outcome = match adopted.clone() {
            Some(op) => Some(self.transform_and_apply(
                &mut state,
                store,
                author,
                op,
                base_version,
                policy,
            )?),
            None => None,
        };

        let mut conflict = state
            .conflicts
            .remove(&conflict_id)
            .ok_or(CollabError::ConflictNotFound(conflict_id))?;
        conflict.resolve(adopted);
        log::info!(
            "Conflict {conflict_id} on {} resolved by {}",
            self.manuscript_id,
            author.user_id
        );
        Ok((conflict, outcome))
    }

    /// Drop pending conflicts raised for a session that has gone away.
    pub async fn discard_conflicts_of(&self, session_id: SessionId) -> usize {
        let mut state = self.state.lock().await;
        let before = state.conflicts.len();
        state.conflicts.retain(|_, c| c.session_id != session_id);
        before - state.conflicts.len()
    }

    pub async fn pending_conflicts(&self) -> usize {
        self.state.lock().await.conflicts.len()
    }

    pub async fn add_comment(
        &self,
        store: &dyn DocumentStore,
        author: &Author,
        content: String,
        anchor_position: usize,
        anchor_length: usize,
        mentions: Vec<UserId>,
    ) -> Result<Comment> {
        check_comment_text(&content)?;
        let mut state = self.state.lock().await;
        CommentBook::check_anchor(anchor_position, anchor_length, state.document.len())?;

        let comment = Comment::new(
            self.manuscript_id.clone(),
            author.user_id.clone(),
            author.user_name.clone(),
            content,
            anchor_position,
            anchor_length,
            mentions,
        );
        store.persist_comment(&comment)?;
        state.comments.upsert(comment.clone());
        Ok(comment)
    }

    /// Append a reply. Returns the updated comment and the new thread entry.
    pub async fn reply(
        &self,
        store: &dyn DocumentStore,
        author: &Author,
        comment_id: CommentId,
        content: String,
        mentions: Vec<UserId>,
    ) -> Result<(Comment, CommentThread)> {
        check_comment_text(&content)?;
        let reply = CommentThread {
            id: CommentId::new(),
            author_id: author.user_id.clone(),
            author_name: author.user_name.clone(),
            content,
            mentions,
            created_at: chrono::Utc::now(),
        };
        let mut state = self.state.lock().await;
        let updated = state.comments.draft_reply(comment_id, reply.clone())?;
        store.persist_comment(&updated)?;
        state.comments.upsert(updated.clone());
        Ok((updated, reply))
    }

    pub async fn set_comment_status(
        &self,
        store: &dyn DocumentStore,
        comment_id: CommentId,
        target: CommentStatus,
    ) -> Result<Comment> {
        let mut state = self.state.lock().await;
        let updated = state.comments.draft_transition(comment_id, target)?;
        store.persist_comment(&updated)?;
        state.comments.upsert(updated.clone());
        Ok(updated)
    }

    pub async fn comments(&self, status: Option<CommentStatus>) -> Vec<Comment> {
        self.state.lock().await.comments.list(status)
    }

    /// Snapshot the current version. Returns the existing snapshot if there is one.
    pub async fn snapshot(
        &self,
        store: &dyn DocumentStore,
        author_id: UserId,
        description: Option<String>,
    ) -> Result<Arc<VersionSnapshot>> {
        let mut state = self.state.lock().await;
        self.take_snapshot(&mut state, store, author_id, description)
    }

    /// Snapshot if edits were applied since the last one.
    pub async fn flush(&self, store: &dyn DocumentStore) -> Result<Option<Arc<VersionSnapshot>>> {
        let mut state = self.state.lock().await;
        if state.edits_since_snapshot == 0 {
            return Ok(None);
        }
        self.take_snapshot(
            &mut state,
            store,
            UserId::new(SYSTEM_AUTHOR),
            Some("Room closed".to_string()),
        )
        .map(Some)
    }

    fn take_snapshot(
        &self,
        state: &mut RoomState,
        store: &dyn DocumentStore,
        author_id: UserId,
        description: Option<String>,
    ) -> Result<Arc<VersionSnapshot>> {
        if let Some(existing) = state.versions.get(state.document.version()) {
            return Ok(existing);
        }
        let parent = state
            .versions
            .latest_version()
            .unwrap_or(self.log.base_version());
        let changes = self
            .log
            .since(parent)
            .iter()
            .map(|e| CollaborativeEdit::clone(e))
            .collect();
        let snapshot = state
            .versions
            .capture(&state.document, changes, author_id, description);
        store.persist_snapshot(&snapshot)?;
        state.edits_since_snapshot = 0;
        log::info!(
            "Snapshot of {} at v{} ({} changes)",
            self.manuscript_id,
            snapshot.version,
            snapshot.changes.len()
        );
        Ok(state.versions.record(snapshot))
    }

    /// Only the content copies are taken under the room lock.
    pub async fn diff(&self, from_version: u64, to_version: u64) -> Result<VersionDiff> {
        let (old, new) = {
            let state = self.state.lock().await;
            state
                .versions
                .contents_for(&state.document, from_version, to_version)?
        };
        Ok(VersionDiff::between(
            self.manuscript_id.clone(),
            from_version,
            to_version,
            &old,
            &new,
        ))
    }

    pub async fn versions(&self) -> Vec<VersionSummary> {
        self.state.lock().await.versions.summaries()
    }

    /// Hold the room for one joining or joined session.
    pub fn pin(&self) {
        let mut occupancy = self.occupancy.lock();
        occupancy.pins += 1;
        occupancy.empty_since = None;
    }

    /// Release a pin taken by [`pin`](Self::pin). The room starts idling when
    /// the last one goes.
    pub fn unpin(&self) {
        let mut occupancy = self.occupancy.lock();
        occupancy.pins = occupancy.pins.saturating_sub(1);
        if occupancy.pins == 0 {
            occupancy.empty_since.get_or_insert_with(Instant::now);
        }
    }

    pub fn pins(&self) -> usize {
        self.occupancy.lock().pins
    }

    /// Whether the room has had no sessions for at least `grace`.
    pub fn idle_for(&self, grace: Duration) -> bool {
        let occupancy = self.occupancy.lock();
        occupancy.pins == 0
            && occupancy
                .empty_since
                .is_some_and(|since| since.elapsed() >= grace)
    }
}

fn check_comment_text(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(CollabError::InvalidOperation(
            "comment content must not be empty".into(),
        ));
    }
    Ok(())
}

/// Maps manuscript ids to loaded rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<ManuscriptId, Arc<ManuscriptRoom>>>,
    store: Arc<dyn DocumentStore>,
}

impl RoomManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Get the room for a manuscript, loading it from the store on first use.
    pub async fn get_or_load(&self, manuscript_id: &ManuscriptId) -> Result<Arc<ManuscriptRoom>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(manuscript_id) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock to load
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(manuscript_id) {
            return Ok(room.clone());
        }

        let room = Arc::new(ManuscriptRoom::load(self.store.as_ref(), manuscript_id)?);
        rooms.insert(manuscript_id.clone(), room.clone());
        Ok(room)
    }

    pub async fn get(&self, manuscript_id: &ManuscriptId) -> Option<Arc<ManuscriptRoom>> {
        self.rooms.read().await.get(manuscript_id).cloned()
    }

    /// Unload a room if it is still idle. Checked under the write lock, so a
    /// join that pinned the room in the meantime keeps it.
    pub async fn remove_if_idle(
        &self,
        manuscript_id: &ManuscriptId,
        grace: Duration,
    ) -> Option<Arc<ManuscriptRoom>> {
        let mut rooms = self.rooms.write().await;
        if rooms.get(manuscript_id)?.idle_for(grace) {
            return rooms.remove(manuscript_id);
        }
        None
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_manuscripts(&self) -> Vec<ManuscriptId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn rooms(&self) -> Vec<Arc<ManuscriptRoom>> {
        self.rooms.read().await.values().cloned().collect()
    }
}
