//! Session registry: who is connected to which manuscript.
//!
//! ```text
//!   by_manuscript: ManuscriptId ──► {SessionId}
//!   sessions:      SessionId    ──► Arc<Session> ── ConnectionHandle ──► outbox
//!   by_connection: ConnectionId ──► SessionId
//! ```
//!
//! The three maps change together under one registry lock. Activity updates
//! (touch, cursor) only take the read lock plus the session's own lock.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::error::{CollabError, Result};
use crate::ids::{ConnectionId, ManuscriptId, SessionId, UserId};

/// Pre-encoded text frame, shared between all recipients of a broadcast.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Author,
    Editor,
    #[default]
    Reviewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

/// Result of handing a frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Outbox full; the frame was dropped and the peer marked lagged.
    Dropped,
    Closed,
}

/// Sending side of one transport connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<Frame>,
    close: Arc<Notify>,
    lagged: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbox of `capacity` frames.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            outbox,
            close: Arc::new(Notify::new()),
            lagged: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Never waits: a full outbox drops the frame.
    pub fn try_deliver(&self, frame: Frame) -> Delivery {
        match self.outbox.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.lagged.store(true, Ordering::Release);
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Clear and return the lagged flag.
    pub fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::AcqRel)
    }

    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }

    /// Ask the connection task to close the socket.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close.notified().await
    }
}

#[derive(Debug)]
struct Activity {
    last_activity: DateTime<Utc>,
    cursor: Option<usize>,
    selection: Option<Selection>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub manuscript_id: ManuscriptId,
    pub user_id: UserId,
    pub user_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    connection: ConnectionHandle,
    active: AtomicBool,
    activity: Mutex<Activity>,
}

impl Session {
    pub fn new(
        manuscript_id: ManuscriptId,
        user_id: UserId,
        user_name: impl Into<String>,
        role: Role,
        connection: ConnectionHandle,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            manuscript_id,
            user_id,
            user_name: user_name.into(),
            role,
            joined_at: now,
            connection,
            active: AtomicBool::new(true),
            activity: Mutex::new(Activity {
                last_activity: now,
                cursor: None,
                selection: None,
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn touch(&self) {
        self.activity.lock().last_activity = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity.lock().last_activity
    }

    pub fn set_cursor(&self, cursor: Option<usize>, selection: Option<Selection>) {
        let mut activity = self.activity.lock();
        activity.cursor = cursor;
        activity.selection = selection;
        activity.last_activity = Utc::now();
    }

    pub fn info(&self) -> SessionInfo {
        let activity = self.activity.lock();
        SessionInfo {
            session_id: self.id,
            manuscript_id: self.manuscript_id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            role: self.role,
            joined_at: self.joined_at,
            last_activity: activity.last_activity,
            cursor: activity.cursor,
            selection: activity.selection,
        }
    }
}

/// Serializable view of a session, sent in sync states and presence events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub manuscript_id: ManuscriptId,
    pub user_id: UserId,
    pub user_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_manuscript: HashMap<ManuscriptId, BTreeSet<SessionId>>,
    by_connection: HashMap<ConnectionId, SessionId>,
}

impl RegistryInner {
    fn remove(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let session = self.sessions.remove(&id)?;
        if let Some(ids) = self.by_manuscript.get_mut(&session.manuscript_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_manuscript.remove(&session.manuscript_id);
            }
        }
        if self.by_connection.get(&session.connection.id()) == Some(&id) {
            self.by_connection.remove(&session.connection.id());
        }
        session.deactivate();
        Some(session)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, ending any session already bound to its connection.
    ///
    /// Returns the new session and the one it replaced. Fails with
    /// `SessionLimit` when the manuscript already holds `limit` sessions, in
    /// which case nothing changes.
    pub fn register(
        &self,
        session: Session,
        limit: usize,
    ) -> Result<(Arc<Session>, Option<Arc<Session>>)> {
        let mut inner = self.inner.write();

        let previous = inner.by_connection.get(&session.connection.id()).copied();
        let replaced_here = previous
            .and_then(|id| inner.sessions.get(&id))
            .is_some_and(|s| s.manuscript_id == session.manuscript_id);
        let current = inner
            .by_manuscript
            .get(&session.manuscript_id)
            .map_or(0, BTreeSet::len);
        if current - usize::from(replaced_here) >= limit {
            return Err(CollabError::SessionLimit(session.manuscript_id.clone()));
        }

        let replaced = previous.and_then(|id| inner.remove(id));

        let session = Arc::new(session);
        inner.sessions.insert(session.id, session.clone());
        inner
            .by_manuscript
            .entry(session.manuscript_id.clone())
            .or_default()
            .insert(session.id);
        inner
            .by_connection
            .insert(session.connection.id(), session.id);
        Ok((session, replaced))
    }

    /// Remove a session. Unknown ids are ignored.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.write().remove(id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(&id).cloned()
    }

    pub fn session_for_connection(&self, connection: ConnectionId) -> Option<Arc<Session>> {
        let inner = self.inner.read();
        let id = inner.by_connection.get(&connection)?;
        inner.sessions.get(id).cloned()
    }

    pub fn sessions_for(&self, manuscript_id: &ManuscriptId) -> Vec<Arc<Session>> {
        let inner = self.inner.read();
        inner
            .by_manuscript
            .get(manuscript_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_for(&self, manuscript_id: &ManuscriptId) -> usize {
        self.inner
            .read()
            .by_manuscript
            .get(manuscript_id)
            .map_or(0, BTreeSet::len)
    }

    /// Record activity on a session.
    pub fn touch(&self, id: SessionId) -> Result<Arc<Session>> {
        let session = self.get(id).ok_or(CollabError::InvalidSession(id))?;
        session.touch();
        Ok(session)
    }

    /// Sessions whose last activity is older than `threshold`.
    pub fn idle_sessions(&self, threshold: Duration) -> Vec<Arc<Session>> {
        let cutoff = Utc::now() - threshold;
        self.inner
            .read()
            .sessions
            .values()
            .filter(|s| s.last_activity() < cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }
}
