//! # manuscript-collab: Real-time collaborative manuscript editing
//!
//! Several authors and reviewers edit the same manuscript over WebSocket.
//! Concurrent edits are reconciled with operational transformation against a
//! single authoritative document per manuscript.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON envelopes   ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │ (per user)   │    over WebSocket  │ (central)    │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ CollabService │── SessionRegistry
//!                                    └───────┬───────┘── Broadcaster
//!                                            │
//!                              ┌─────────────┴─────────────┐
//!                              ▼                           ▼
//!                      ManuscriptRoom              ManuscriptRoom
//!                      Document + EditLog          ...
//!                      comments, versions
//!                              │
//!                              ▼
//!                       DocumentStore (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`operation`], [`transform`], [`document`]: edits, OT and the authoritative text
//! - [`comments`], [`versions`], [`diff`], [`conflict`]: annotations and history
//! - [`session`], [`broadcast`]: connected users and fan-out with backpressure
//! - [`room`], [`service`]: the per-manuscript pipeline and request handling
//! - [`protocol`]: JSON wire format
//! - [`storage`]: persistence (RocksDB with LZ4 + bincode, or in memory)
//! - [`server`], [`client`]: WebSocket endpoints
//! - [`config`], [`directory`], [`notify`]: configuration, user profiles, mentions

pub mod ids;
pub mod error;
pub mod operation;
pub mod transform;
pub mod document;
pub mod conflict;
pub mod comments;
pub mod diff;
pub mod versions;
pub mod session;
pub mod protocol;
pub mod storage;
pub mod broadcast;
pub mod room;
pub mod service;
pub mod config;
pub mod directory;
pub mod notify;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use ids::{CommentId, ConflictId, ConnectionId, ManuscriptId, SessionId, UserId};
pub use error::{CollabError, Result};
pub use operation::{CollaborativeEdit, EditOperation, OperationKind};
pub use transform::{transform, TransformOutcome};
pub use document::{Document, EditLog};
pub use conflict::{ConflictReason, ConflictResolution};
pub use comments::{Comment, CommentBook, CommentStatus, CommentThread};
pub use versions::{DiffSummary, VersionDiff, VersionHistory, VersionSnapshot, VersionSummary};
pub use session::{ConnectionHandle, Role, Selection, Session, SessionInfo, SessionRegistry};
pub use protocol::{
    ClientMessage, Envelope, ErrorCode, MessageType, ProtocolError, ServerMessage,
};
pub use storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use broadcast::{BroadcastStats, Broadcaster};
pub use room::{EditOutcome, EditPolicy, ManuscriptRoom, RoomManager};
pub use service::{CollabService, ServiceStats};
pub use config::{ConfigError, ServerConfig};
pub use directory::{StaticDirectory, UserDirectory, UserProfile};
pub use notify::{LogNotifier, MentionNotification, NotificationSink, RecordingNotifier};
pub use server::{CollabServer, ServerStats};
pub use client::{ClientEvent, CollabClient, ConnectionState, OfflineQueue};
