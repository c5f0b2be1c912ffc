//! The collaboration service: sessions, rooms and broadcast behind one API.
//!
//! ```text
//!   connection task ── ClientMessage ──► CollabService::handle
//!                                           │
//!              ┌────────────────────────────┼──────────────────────────┐
//!              ▼                            ▼                          ▼
//!       SessionRegistry              RoomManager ── room lock ──  DocumentStore
//!      (who is connected)        (transform, apply, comments,
//!              │                     snapshots per manuscript)
//!              └──────────────► Broadcaster (after the room lock is released)
//! ```
//!
//! Each operation returns what the requester should see. Messages for other
//! sessions are fanned out here.

use std::sync::Arc;

use crate::broadcast::{BroadcastStats, Broadcaster};
use crate::comments::{Comment, CommentStatus};
use crate::config::ServerConfig;
use crate::conflict::ConflictResolution;
use crate::directory::{StaticDirectory, UserDirectory};
use crate::error::{CollabError, Result};
use crate::ids::{ConnectionId, ManuscriptId, SessionId, UserId};
use crate::notify::{excerpt, LogNotifier, MentionNotification, NotificationSink};
use crate::protocol::{
    ClientMessage, CommentAction, CommentEvent, CommentEventKind, ConflictResolveRequest,
    CursorBroadcast, CursorUpdate, EditBroadcast, EditRequest, JoinAck, JoinRequest, LeaveAck,
    PresenceEvent, PresenceKind, ServerMessage, SyncRequest, SyncResponse, SyncState,
};
use crate::room::{Author, EditOutcome, EditPolicy, ManuscriptRoom, RoomManager};
use crate::session::{ConnectionHandle, Frame, Session, SessionInfo, SessionRegistry};
use crate::storage::{DocumentStore, ManuscriptMeta};
use crate::versions::{VersionDiff, VersionSnapshot, VersionSummary};

/// Point-in-time service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub active_sessions: usize,
    pub loaded_rooms: usize,
    pub broadcast: BroadcastStats,
}

pub struct CollabService {
    config: ServerConfig,
    rooms: RoomManager,
    sessions: SessionRegistry,
    broadcaster: Broadcaster,
    directory: Arc<dyn UserDirectory>,
    notifier: Arc<dyn NotificationSink>,
}

impl CollabService {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn UserDirectory>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            rooms: RoomManager::new(store),
            sessions: SessionRegistry::new(),
            broadcaster: Broadcaster::new(),
            directory,
            notifier,
        }
    }

    /// Directory from `config.users`, mentions written to the log.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let directory = Arc::new(StaticDirectory::new(config.users.clone()));
        Self::new(config, store, directory, Arc::new(LogNotifier))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        self.rooms.store()
    }

    fn policy(&self) -> EditPolicy {
        EditPolicy {
            max_transform_distance: self.config.max_transform_distance,
            auto_snapshot_interval: self.config.auto_snapshot_interval,
        }
    }

    // ─── Manuscripts ────────────────────────────────────────────────

    pub fn create_manuscript(&self, id: &ManuscriptId, content: &str) -> Result<()> {
        self.store().create_document(id, content)?;
        Ok(())
    }

    pub fn list_manuscripts(&self) -> Result<Vec<ManuscriptMeta>> {
        Ok(self.store().list_documents()?)
    }

    /// Current content and version of a manuscript.
    pub async fn document(&self, id: &ManuscriptId) -> Result<(String, u64)> {
        let room = self.rooms.get_or_load(id).await?;
        let state = room.sync_state(Vec::new()).await;
        Ok((state.content, state.version))
    }

    // ─── Sessions ───────────────────────────────────────────────────

    /// Join a manuscript on `connection`, ending any session already bound to it.
    pub async fn join(&self, connection: &ConnectionHandle, req: JoinRequest) -> Result<JoinAck> {
        let room = self.room_for_join(&req.manuscript_id).await?;

        let profile = self.directory.lookup(&req.user_id);
        let user_name = profile
            .as_ref()
            .map(|p| p.name.clone())
            .or(req.user_name)
            .unwrap_or_else(|| req.user_id.to_string());
        let role = profile.map(|p| p.role).or(req.role).unwrap_or_default();

        let session = Session::new(
            req.manuscript_id.clone(),
            req.user_id,
            user_name,
            role,
            connection.clone(),
        );
        let (session, replaced) = match self
            .sessions
            .register(session, self.config.max_sessions_per_manuscript)
        {
            Ok(registered) => registered,
            Err(e) => {
                room.unpin();
                return Err(e);
            }
        };
        if let Some(previous) = replaced {
            self.after_removal(&previous, PresenceKind::UserLeft).await;
        }

        let info = session.info();
        let state = room.sync_state(self.sessions_for(&req.manuscript_id)).await;
        self.broadcast(
            &session.manuscript_id,
            &ServerMessage::Presence(PresenceEvent {
                event: PresenceKind::UserJoined,
                session: info.clone(),
            }),
            Some(session.as_ref()),
            Some(session.id),
        );
        log::info!(
            "{} ({}) joined {} as {:?} [session {}]",
            session.user_name,
            session.user_id,
            session.manuscript_id,
            session.role,
            session.id
        );
        Ok(JoinAck {
            session: info,
            state,
        })
    }

    /// Load the room and pin it against eviction. The pin is released when
    /// the session ends.
    async fn room_for_join(&self, id: &ManuscriptId) -> Result<Arc<ManuscriptRoom>> {
        loop {
            let room = self.rooms.get_or_load(id).await?;
            room.pin();
            // An eviction may have won the race between load and pin.
            match self.rooms.get(id).await {
                Some(current) if Arc::ptr_eq(&current, &room) => return Ok(room),
                _ => room.unpin(),
            }
        }
    }

    /// End a session. Unknown or already ended sessions are ignored.
    pub async fn leave(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.end_session(session_id, PresenceKind::UserLeft).await
    }

    /// Connection lost: same path as leave.
    pub async fn disconnect(&self, connection: ConnectionId) -> Option<SessionInfo> {
        let session = self.sessions.session_for_connection(connection)?;
        self.end_session(session.id, PresenceKind::UserLeft).await
    }

    async fn end_session(&self, session_id: SessionId, kind: PresenceKind) -> Option<SessionInfo> {
        let session = self.sessions.remove(session_id)?;
        self.after_removal(&session, kind).await;
        Some(session.info())
    }

    async fn after_removal(&self, session: &Session, kind: PresenceKind) {
        let info = session.info();
        self.broadcast(
            &session.manuscript_id,
            &ServerMessage::Presence(PresenceEvent {
                event: kind,
                session: info,
            }),
            Some(session),
            Some(session.id),
        );
        if let Some(room) = self.rooms.get(&session.manuscript_id).await {
            room.discard_conflicts_of(session.id).await;
            room.unpin();
        }
        log::info!(
            "{} left {} ({kind:?}) [session {}]",
            session.user_id,
            session.manuscript_id,
            session.id
        );
    }

    pub fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(session_id)
    }

    pub fn session_for_connection(&self, connection: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.session_for_connection(connection)
    }

    pub fn sessions_for(&self, manuscript_id: &ManuscriptId) -> Vec<SessionInfo> {
        self.sessions
            .sessions_for(manuscript_id)
            .iter()
            .map(|s| s.info())
            .collect()
    }

    pub fn touch(&self, session_id: SessionId) -> Result<()> {
        self.sessions.touch(session_id).map(|_| ())
    }

    fn active_session(&self, session_id: SessionId) -> Result<Arc<Session>> {
        self.sessions.touch(session_id)
    }

    async fn room_of(&self, session: &Session) -> Result<Arc<ManuscriptRoom>> {
        self.rooms
            .get(&session.manuscript_id)
            .await
            .ok_or_else(|| CollabError::InvalidSession(session.id))
    }

    // ─── Edits ──────────────────────────────────────────────────────

    /// Transform and apply an edit, then broadcast it to every session,
    /// the submitter included.
    pub async fn submit_edit(&self, session_id: SessionId, req: EditRequest) -> Result<EditOutcome> {
        let session = self.active_session(session_id)?;
        let room = self.room_of(&session).await?;
        let outcome = room
            .submit_edit(
                self.store().as_ref(),
                &Author::from(session.as_ref()),
                req.operation,
                req.base_version,
                self.policy(),
            )
            .await?;
        self.publish_edit(&session, &outcome);
        Ok(outcome)
    }

    fn publish_edit(&self, session: &Session, outcome: &EditOutcome) {
        if let EditOutcome::Applied { edits, version, .. } = outcome {
            let message = ServerMessage::Edit(EditBroadcast {
                manuscript_id: session.manuscript_id.clone(),
                edits: edits.iter().map(|e| e.as_ref().clone()).collect(),
                version: *version,
            });
            self.broadcast(&session.manuscript_id, &message, Some(session), None);
        }
    }

    /// Settle a conflict this session received. An adopted operation goes
    /// through the normal edit path.
    pub async fn resolve_conflict(
        &self,
        session_id: SessionId,
        req: ConflictResolveRequest,
    ) -> Result<(ConflictResolution, Option<EditOutcome>)> {
        let session = self.active_session(session_id)?;
        let room = self.room_of(&session).await?;
        let (resolved, outcome) = room
            .resolve_conflict(
                self.store().as_ref(),
                &Author::from(session.as_ref()),
                req.conflict_id,
                req.adopted,
                req.base_version,
                self.policy(),
            )
            .await?;
        if let Some(outcome) = &outcome {
            self.publish_edit(&session, outcome);
        }
        Ok((resolved, outcome))
    }

    // ─── Comments ───────────────────────────────────────────────────

    /// Apply a comment action and broadcast the resulting event to everyone.
    pub async fn comment(&self, session_id: SessionId, action: CommentAction) -> Result<CommentEvent> {
        let session = self.active_session(session_id)?;
        let room = self.room_of(&session).await?;
        let store = self.store().as_ref();
        let author = Author::from(session.as_ref());

        let event = match action {
            CommentAction::Add {
                content,
                anchor_position,
                anchor_length,
                mentions,
            } => {
                let comment = room
                    .add_comment(store, &author, content, anchor_position, anchor_length, mentions)
                    .await?;
                self.notify_mentions(&comment, &author, &comment.mentions, &comment.content);
                CommentEvent {
                    event: CommentEventKind::Added,
                    comment,
                }
            }
            CommentAction::Reply {
                comment_id,
                content,
                mentions,
            } => {
                let (comment, reply) = room
                    .reply(store, &author, comment_id, content, mentions)
                    .await?;
                self.notify_mentions(&comment, &author, &reply.mentions, &reply.content);
                CommentEvent {
                    event: CommentEventKind::Replied,
                    comment,
                }
            }
            CommentAction::Resolve { comment_id } => CommentEvent {
                event: CommentEventKind::Resolved,
                comment: room
                    .set_comment_status(store, comment_id, CommentStatus::Resolved)
                    .await?,
            },
            CommentAction::Reopen { comment_id } => CommentEvent {
                event: CommentEventKind::Reopened,
                comment: room
                    .set_comment_status(store, comment_id, CommentStatus::Open)
                    .await?,
            },
            CommentAction::Archive { comment_id } => CommentEvent {
                event: CommentEventKind::Archived,
                comment: room
                    .set_comment_status(store, comment_id, CommentStatus::Archived)
                    .await?,
            },
        };

        log::debug!(
            "Comment {} {:?} by {} on {}",
            event.comment.id,
            event.event,
            session.user_id,
            session.manuscript_id
        );
        self.broadcast(
            &session.manuscript_id,
            &ServerMessage::Comment(event.clone()),
            Some(session.as_ref()),
            None,
        );
        Ok(event)
    }

    fn notify_mentions(&self, comment: &Comment, author: &Author, mentions: &[UserId], text: &str) {
        let mut seen: Vec<&UserId> = Vec::with_capacity(mentions.len());
        for recipient in mentions {
            if *recipient == author.user_id || seen.contains(&recipient) {
                continue;
            }
            seen.push(recipient);
            self.notifier.notify(MentionNotification {
                manuscript_id: comment.manuscript_id.clone(),
                comment_id: comment.id,
                recipient: recipient.clone(),
                author_id: author.user_id.clone(),
                author_name: author.user_name.clone(),
                excerpt: excerpt(text),
                created_at: chrono::Utc::now(),
            });
        }
    }

    pub async fn comments(
        &self,
        manuscript_id: &ManuscriptId,
        status: Option<CommentStatus>,
    ) -> Result<Vec<Comment>> {
        let room = self.rooms.get_or_load(manuscript_id).await?;
        Ok(room.comments(status).await)
    }

    // ─── Presence ───────────────────────────────────────────────────

    /// Record a cursor move and show it to the other sessions. Not persisted.
    pub async fn update_cursor(&self, session_id: SessionId, update: CursorUpdate) -> Result<()> {
        let session = self.active_session(session_id)?;
        session.set_cursor(update.position, update.selection);
        log::trace!("Cursor of {} at {:?}", session.id, update.position);
        self.broadcast(
            &session.manuscript_id,
            &ServerMessage::Cursor(CursorBroadcast {
                session_id: session.id,
                user_id: session.user_id.clone(),
                user_name: session.user_name.clone(),
                position: update.position,
                selection: update.selection,
            }),
            Some(session.as_ref()),
            Some(session.id),
        );
        Ok(())
    }

    /// End sessions idle past `idle_timeout_secs` and close their connections.
    pub async fn reap_idle_sessions(&self) -> usize {
        let threshold = chrono::Duration::seconds(self.config.idle_timeout_secs as i64);
        let idle = self.sessions.idle_sessions(threshold);
        let mut reaped = 0;
        for session in idle {
            if self
                .end_session(session.id, PresenceKind::IdleTimeout)
                .await
                .is_some()
            {
                session.connection().close();
                reaped += 1;
            }
        }
        if reaped > 0 {
            log::info!("Reaped {reaped} idle session(s)");
        }
        reaped
    }

    /// Unload rooms that have been empty for `room_grace_secs`, snapshotting
    /// unsaved edits first.
    pub async fn evict_idle_rooms(&self) -> usize {
        let grace = self.config.room_grace();
        let mut evicted = 0;
        for room in self.rooms.rooms().await {
            if !room.idle_for(grace) {
                continue;
            }
            if let Err(e) = room.flush(self.store().as_ref()).await {
                log::error!("Failed to snapshot {} before eviction: {e}", room.manuscript_id());
                continue;
            }
            if self.rooms.remove_if_idle(room.manuscript_id(), grace).await.is_some() {
                log::info!("Room {} unloaded (idle)", room.manuscript_id());
                evicted += 1;
            }
        }
        evicted
    }

    // ─── Sync & versions ────────────────────────────────────────────

    pub async fn sync(&self, session_id: SessionId, request: SyncRequest) -> Result<SyncResponse> {
        let session = self.active_session(session_id)?;
        let room = self.room_of(&session).await?;
        Ok(match request {
            SyncRequest::State => {
                SyncResponse::State(room.sync_state(self.sessions_for(&session.manuscript_id)).await)
            }
            SyncRequest::Snapshot { description } => {
                let snapshot = room
                    .snapshot(self.store().as_ref(), session.user_id.clone(), description)
                    .await?;
                SyncResponse::Snapshot(snapshot.as_ref().clone())
            }
            SyncRequest::Diff {
                from_version,
                to_version,
            } => SyncResponse::Diff(room.diff(from_version, to_version).await?),
            SyncRequest::Versions => SyncResponse::Versions {
                versions: room.versions().await,
            },
        })
    }

    /// Sync state of the session's manuscript, for catching up a lagging peer.
    pub async fn state_for(&self, session_id: SessionId) -> Result<SyncState> {
        let session = self.sessions.get(session_id).ok_or(CollabError::InvalidSession(session_id))?;
        let room = self.room_of(&session).await?;
        Ok(room.sync_state(self.sessions_for(&session.manuscript_id)).await)
    }

    pub async fn snapshot(
        &self,
        manuscript_id: &ManuscriptId,
        author_id: UserId,
        description: Option<String>,
    ) -> Result<Arc<VersionSnapshot>> {
        let room = self.rooms.get_or_load(manuscript_id).await?;
        room.snapshot(self.store().as_ref(), author_id, description).await
    }

    pub async fn diff(&self, manuscript_id: &ManuscriptId, from: u64, to: u64) -> Result<VersionDiff> {
        let room = self.rooms.get_or_load(manuscript_id).await?;
        room.diff(from, to).await
    }

    pub async fn versions(&self, manuscript_id: &ManuscriptId) -> Result<Vec<VersionSummary>> {
        let room = self.rooms.get_or_load(manuscript_id).await?;
        Ok(room.versions().await)
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    /// Handle one client message from `connection`. Returns the replies for
    /// the requester; everything meant for other sessions is already queued.
    ///
    /// `claimed` is the session id the client put on the envelope, if any.
    pub async fn handle(
        &self,
        connection: &ConnectionHandle,
        message: ClientMessage,
        claimed: Option<SessionId>,
    ) -> Result<Vec<ServerMessage>> {
        if let ClientMessage::Join(req) = message {
            let ack = self.join(connection, req).await?;
            return Ok(vec![ServerMessage::Joined(ack)]);
        }

        let session = self
            .sessions
            .session_for_connection(connection.id())
            .ok_or_else(|| CollabError::InvalidSession(claimed.unwrap_or_default()))?;
        if claimed.is_some_and(|id| id != session.id) {
            return Err(CollabError::InvalidSession(claimed.unwrap_or(session.id)));
        }

        Ok(match message {
            ClientMessage::Join(_) => Vec::new(),
            ClientMessage::Leave => {
                self.leave(session.id).await;
                vec![ServerMessage::Left(LeaveAck {
                    session_id: session.id,
                })]
            }
            ClientMessage::Edit(req) => match self.submit_edit(session.id, req).await? {
                EditOutcome::Conflict(conflict) => vec![ServerMessage::Conflict(conflict)],
                EditOutcome::Applied { .. } => Vec::new(),
            },
            ClientMessage::Comment(action) => {
                self.comment(session.id, action).await?;
                Vec::new()
            }
            ClientMessage::Cursor(update) => {
                self.update_cursor(session.id, update).await?;
                Vec::new()
            }
            ClientMessage::Sync(request) => {
                vec![ServerMessage::Sync(self.sync(session.id, request).await?)]
            }
            ClientMessage::Conflict(req) => {
                let (resolved, outcome) = self.resolve_conflict(session.id, req).await?;
                let mut replies = vec![ServerMessage::Conflict(resolved)];
                if let Some(EditOutcome::Conflict(again)) = outcome {
                    replies.push(ServerMessage::Conflict(again));
                }
                replies
            }
        })
    }

    // ─── Broadcast ──────────────────────────────────────────────────

    /// Encode once and queue for every session of the manuscript but `exclude`.
    fn broadcast(
        &self,
        manuscript_id: &ManuscriptId,
        message: &ServerMessage,
        origin: Option<&Session>,
        exclude: Option<SessionId>,
    ) {
        let recipients = self.sessions.sessions_for(manuscript_id);
        if recipients.iter().all(|s| Some(s.id) == exclude) {
            return;
        }
        match self.frame(message, origin) {
            Ok(frame) => {
                self.broadcaster.fan_out(&recipients, frame, exclude);
            }
            Err(e) => log::error!("Failed to encode {} message: {e}", message.kind()),
        }
    }

    pub fn frame(&self, message: &ServerMessage, origin: Option<&Session>) -> Result<Frame> {
        Ok(message.to_frame(origin.map(|s| s.id), origin.map(|s| &s.user_id))?)
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_sessions: self.sessions.len(),
            loaded_rooms: self.rooms.room_count().await,
            broadcast: self.broadcaster.stats(),
        }
    }
}
