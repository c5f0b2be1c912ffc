//! JSON message protocol for manuscript collaboration.
//!
//! Every WebSocket text frame carries one envelope:
//! ```text
//! ┌──────────┬──────────────────────┬───────────┬────────┬───────────┐
//! │ type     │ payload              │ sessionId │ userId │ timestamp │
//! │ string   │ object, per type and │ uuid?     │ str?   │ RFC 3339  │
//! │          │ direction            │           │        │           │
//! └──────────┴──────────────────────┴───────────┴────────┴───────────┘
//! ```
//!
//! `type` is one of `join, leave, edit, comment, cursor, presence, conflict,
//! sync, error`. Payloads are decoded into [`ClientMessage`] on the server and
//! into [`ServerMessage`] on the client.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::comments::Comment;
use crate::conflict::ConflictResolution;
use crate::error::CollabError;
use crate::ids::{CommentId, ConflictId, ManuscriptId, SessionId, UserId};
use crate::operation::{CollaborativeEdit, EditOperation};
use crate::session::{Frame, Role, Selection, SessionInfo};
use crate::versions::{VersionDiff, VersionSnapshot, VersionSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Join,
    Leave,
    Edit,
    Comment,
    Cursor,
    Presence,
    Conflict,
    Sync,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Edit => "edit",
            Self::Comment => "comment",
            Self::Cursor => "cursor",
            Self::Presence => "presence",
            Self::Conflict => "conflict",
            Self::Sync => "sync",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            session_id: None,
            user_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    fn payload<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        let kind = self.kind;
        serde_json::from_value(self.payload).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }

    fn has_empty_payload(&self) -> bool {
        match &self.payload {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

// ─── Client → server ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub manuscript_id: ManuscriptId,
    pub user_id: UserId,
    pub user_name: Option<String>,
    pub role: Option<Role>,
}

/// `userId` may come from the payload or from the envelope.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinPayload {
    manuscript_id: ManuscriptId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    pub operation: EditOperation,
    pub base_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CommentAction {
    Add {
        content: String,
        anchor_position: usize,
        #[serde(default)]
        anchor_length: usize,
        #[serde(default)]
        mentions: Vec<UserId>,
    },
    Reply {
        comment_id: CommentId,
        content: String,
        #[serde(default)]
        mentions: Vec<UserId>,
    },
    Resolve {
        comment_id: CommentId,
    },
    Reopen {
        comment_id: CommentId,
    },
    Archive {
        comment_id: CommentId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub selection: Option<Selection>,
}

/// A `sync` pull. An empty payload asks for the current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SyncRequest {
    State,
    Snapshot {
        #[serde(default)]
        description: Option<String>,
    },
    Diff {
        from_version: u64,
        to_version: u64,
    },
    Versions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolveRequest {
    pub conflict_id: ConflictId,
    /// Replacement operation, or `None` to abandon the edit.
    #[serde(default)]
    pub adopted: Option<EditOperation>,
    #[serde(default)]
    pub base_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Join(JoinRequest),
    Leave,
    Edit(EditRequest),
    Comment(CommentAction),
    Cursor(CursorUpdate),
    Sync(SyncRequest),
    Conflict(ConflictResolveRequest),
}

impl ClientMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Join(_) => MessageType::Join,
            Self::Leave => MessageType::Leave,
            Self::Edit(_) => MessageType::Edit,
            Self::Comment(_) => MessageType::Comment,
            Self::Cursor(_) => MessageType::Cursor,
            Self::Sync(_) => MessageType::Sync,
            Self::Conflict(_) => MessageType::Conflict,
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.kind {
            MessageType::Join => {
                let fallback_user = envelope.user_id.clone();
                let payload: JoinPayload = envelope.payload()?;
                let user_id = payload
                    .user_id
                    .or(fallback_user)
                    .ok_or(ProtocolError::MissingField("userId"))?;
                Ok(Self::Join(JoinRequest {
                    manuscript_id: payload.manuscript_id,
                    user_id,
                    user_name: payload.user_name,
                    role: payload.role,
                }))
            }
            MessageType::Leave => Ok(Self::Leave),
            MessageType::Edit => Ok(Self::Edit(envelope.payload()?)),
            MessageType::Comment => Ok(Self::Comment(envelope.payload()?)),
            MessageType::Cursor => Ok(Self::Cursor(envelope.payload()?)),
            MessageType::Sync => {
                if envelope.has_empty_payload() {
                    Ok(Self::Sync(SyncRequest::State))
                } else {
                    Ok(Self::Sync(envelope.payload()?))
                }
            }
            MessageType::Conflict => Ok(Self::Conflict(envelope.payload()?)),
            kind @ (MessageType::Presence | MessageType::Error) => {
                Err(ProtocolError::UnexpectedType(kind))
            }
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = match self {
            Self::Join(req) => to_payload(&JoinPayload {
                manuscript_id: req.manuscript_id.clone(),
                user_id: Some(req.user_id.clone()),
                user_name: req.user_name.clone(),
                role: req.role,
            })?,
            Self::Leave => Value::Object(Default::default()),
            Self::Edit(req) => to_payload(req)?,
            Self::Comment(action) => to_payload(action)?,
            Self::Cursor(update) => to_payload(update)?,
            Self::Sync(request) => to_payload(request)?,
            Self::Conflict(req) => to_payload(req)?,
        };
        Ok(Envelope::new(self.kind(), payload))
    }
}

// ─── Server → client ────────────────────────────────────────────────

/// Everything a client needs to (re)build its view of a manuscript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub manuscript_id: ManuscriptId,
    pub content: String,
    pub version: u64,
    pub comments: Vec<Comment>,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub session: SessionInfo,
    pub state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveAck {
    pub session_id: SessionId,
}

/// Committed result of one client edit. A split edit yields several entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditBroadcast {
    pub manuscript_id: ManuscriptId,
    pub edits: Vec<CollaborativeEdit>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentEventKind {
    Added,
    Replied,
    Resolved,
    Reopened,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentEvent {
    pub event: CommentEventKind,
    pub comment: Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorBroadcast {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub user_name: String,
    pub position: Option<usize>,
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    UserJoined,
    UserLeft,
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub event: PresenceKind,
    pub session: SessionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SyncResponse {
    State(SyncState),
    Snapshot(VersionSnapshot),
    Diff(VersionDiff),
    Versions { versions: Vec<VersionSummary> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSession,
    InvalidManuscript,
    InvalidOperation,
    OutOfBounds,
    ResyncRequired,
    SessionLimit,
    NotFound,
    PersistenceFailure,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    /// The same request may succeed if sent again.
    pub retryable: bool,
    /// The client should pull a fresh `sync` state before editing again.
    pub resync: bool,
}

impl From<&CollabError> for ErrorPayload {
    fn from(err: &CollabError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            resync: err.requires_resync(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Joined(JoinAck),
    Left(LeaveAck),
    Edit(EditBroadcast),
    Comment(CommentEvent),
    Cursor(CursorBroadcast),
    Presence(PresenceEvent),
    Conflict(ConflictResolution),
    Sync(SyncResponse),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Joined(_) => MessageType::Join,
            Self::Left(_) => MessageType::Leave,
            Self::Edit(_) => MessageType::Edit,
            Self::Comment(_) => MessageType::Comment,
            Self::Cursor(_) => MessageType::Cursor,
            Self::Presence(_) => MessageType::Presence,
            Self::Conflict(_) => MessageType::Conflict,
            Self::Sync(_) => MessageType::Sync,
            Self::Error(_) => MessageType::Error,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = match self {
            Self::Joined(ack) => to_payload(ack)?,
            Self::Left(ack) => to_payload(ack)?,
            Self::Edit(edit) => to_payload(edit)?,
            Self::Comment(event) => to_payload(event)?,
            Self::Cursor(cursor) => to_payload(cursor)?,
            Self::Presence(event) => to_payload(event)?,
            Self::Conflict(conflict) => to_payload(conflict)?,
            Self::Sync(response) => to_payload(response)?,
            Self::Error(error) => to_payload(error)?,
        };
        Ok(Envelope::new(self.kind(), payload))
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        Ok(match envelope.kind {
            MessageType::Join => Self::Joined(envelope.payload()?),
            MessageType::Leave => Self::Left(envelope.payload()?),
            MessageType::Edit => Self::Edit(envelope.payload()?),
            MessageType::Comment => Self::Comment(envelope.payload()?),
            MessageType::Cursor => Self::Cursor(envelope.payload()?),
            MessageType::Presence => Self::Presence(envelope.payload()?),
            MessageType::Conflict => Self::Conflict(envelope.payload()?),
            MessageType::Sync => Self::Sync(envelope.payload()?),
            MessageType::Error => Self::Error(envelope.payload()?),
        })
    }

    /// Encode once into a frame that can be handed to many outboxes.
    pub fn to_frame(
        &self,
        session_id: Option<SessionId>,
        user_id: Option<&UserId>,
    ) -> Result<Frame, ProtocolError> {
        let text = self
            .to_envelope()?
            .with_session(session_id)
            .with_user(user_id.cloned())
            .encode()?;
        Ok(Frame::from(text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unexpected message type: {0}")]
    UnexpectedType(MessageType),

    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(&'static str),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Connection closed")]
    ConnectionClosed,
}
