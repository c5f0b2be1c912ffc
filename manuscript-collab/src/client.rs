//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, join, leave, disconnect)
//! - Typed requests that track the last version seen, so edits carry the
//!   right base version without the caller counting
//! - An offline queue for edits made while disconnected, replayed after the
//!   next successful join
//!
//! Used by the integration tests and by tooling that drives the server.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::ids::{ManuscriptId, SessionId, UserId};
use crate::operation::EditOperation;
use crate::protocol::{
    ClientMessage, CommentAction, ConflictResolveRequest, CursorUpdate, EditRequest, Envelope,
    JoinRequest, ProtocolError, ServerMessage, SyncRequest, SyncResponse,
};
use crate::session::Role;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Message(ServerMessage),
    Disconnected,
}

/// Edits made while disconnected.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<EditRequest>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, edit: EditRequest) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(edit);
        true
    }

    pub fn drain(&mut self) -> Vec<EditRequest> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// State shared with the reader task.
struct Shared {
    state: RwLock<ConnectionState>,
    version: AtomicU64,
    session_id: SyncMutex<Option<SessionId>>,
    offline_queue: Mutex<OfflineQueue>,
}

impl Shared {
    /// Track the manuscript version from what the server reports.
    fn observe(&self, message: &ServerMessage) {
        match message {
            ServerMessage::Joined(ack) => {
                *self.session_id.lock() = Some(ack.session.session_id);
                self.version.store(ack.state.version, Ordering::SeqCst);
            }
            ServerMessage::Left(_) => {
                *self.session_id.lock() = None;
            }
            ServerMessage::Edit(edit) => {
                self.version.fetch_max(edit.version, Ordering::SeqCst);
            }
            ServerMessage::Sync(SyncResponse::State(state)) => {
                self.version.store(state.version, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

pub struct CollabClient {
    user_id: UserId,
    server_url: String,
    shared: Arc<Shared>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl CollabClient {
    pub fn new(user_id: impl Into<UserId>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            server_url: server_url.into(),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                version: AtomicU64::new(0),
                session_id: SyncMutex::new(None),
                offline_queue: Mutex::new(OfflineQueue::new(10_000)),
            }),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server envelopes into events
        let event_tx = self.event_tx.clone();
        let shared = self.shared.clone();
        let replay_tx = out_tx.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let message = match Envelope::decode(text.as_str())
                            .and_then(ServerMessage::from_envelope)
                        {
                            Ok(message) => message,
                            Err(e) => {
                                log::warn!("Undecodable server message: {e}");
                                continue;
                            }
                        };
                        shared.observe(&message);
                        if let ServerMessage::Joined(_) = message {
                            replay_offline(&shared, &replay_tx, &user_id).await;
                        }
                        let _ = event_tx.send(ClientEvent::Message(message)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *shared.state.write().await = ConnectionState::Disconnected;
            *shared.session_id.lock() = None;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        self.outgoing_tx = Some(out_tx);
        *self.shared.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        Ok(())
    }

    /// Close the connection. Queued edits stay queued.
    pub async fn disconnect(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn join(
        &self,
        manuscript_id: impl Into<ManuscriptId>,
        user_name: Option<String>,
        role: Option<Role>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Join(JoinRequest {
            manuscript_id: manuscript_id.into(),
            user_id: self.user_id.clone(),
            user_name,
            role,
        }))
        .await
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Leave).await
    }

    /// Submit an edit against the last version this client has seen.
    ///
    /// While disconnected the edit is queued and replayed after the next join.
    pub async fn edit(&self, operation: EditOperation) -> Result<(), ProtocolError> {
        let request = EditRequest {
            operation,
            base_version: self.version(),
        };
        if self.connection_state().await != ConnectionState::Connected {
            let mut queue = self.shared.offline_queue.lock().await;
            if !queue.enqueue(request) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(ClientMessage::Edit(request)).await
    }

    /// Submit an edit against an explicit base version.
    pub async fn edit_at(&self, operation: EditOperation, base_version: u64) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Edit(EditRequest {
            operation,
            base_version,
        }))
        .await
    }

    pub async fn comment(&self, action: CommentAction) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Comment(action)).await
    }

    pub async fn cursor(&self, update: CursorUpdate) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(()); // Cursor updates are dropped when offline
        }
        self.send(ClientMessage::Cursor(update)).await
    }

    pub async fn sync(&self, request: SyncRequest) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Sync(request)).await
    }

    pub async fn resolve_conflict(&self, request: ConflictResolveRequest) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Conflict(request)).await
    }

    /// Send any client message, tagged with our user and session.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let text = encode(&message, self.session_id(), &self.user_id)?;
        tx.send(text).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Last manuscript version reported by the server.
    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        *self.shared.session_id.lock()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.offline_queue.lock().await.len()
    }
}

fn encode(
    message: &ClientMessage,
    session_id: Option<SessionId>,
    user_id: &UserId,
) -> Result<String, ProtocolError> {
    message
        .to_envelope()?
        .with_session(session_id)
        .with_user(Some(user_id.clone()))
        .encode()
}

async fn replay_offline(shared: &Shared, tx: &mpsc::Sender<String>, user_id: &UserId) {
    let queued = shared.offline_queue.lock().await.drain();
    if queued.is_empty() {
        return;
    }
    log::info!("Replaying {} queued edits", queued.len());
    let session_id = *shared.session_id.lock();
    for edit in queued {
        match encode(&ClientMessage::Edit(edit), session_id, user_id) {
            Ok(text) => {
                if tx.send(text).await.is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Dropping queued edit: {e}"),
        }
    }
}
