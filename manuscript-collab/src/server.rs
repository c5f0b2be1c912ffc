//! WebSocket server: one task per connection, one room per manuscript.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── Room (ms-1) ── Document + EditLog
//!             ├── connection tasks ──────┤                  │
//! Client B ──┘     (JSON envelopes)      │                  ├── DocumentStore
//!                        │               └── Room (ms-2)    │     (RocksDB / memory)
//!                        ▼                                  │
//!                  CollabService ── Broadcaster ── outbox per connection
//!                        │
//!                        └── maintenance task: idle reaper, room eviction
//! ```
//!
//! Each connection task runs an explicit `select!` loop over the socket, its
//! bounded outbox, a heartbeat timer and a close signal. Replies to the
//! requester go straight to the socket; broadcasts arrive through the outbox.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::protocol::{ClientMessage, Envelope, ErrorPayload, ServerMessage, SyncResponse};
use crate::service::{CollabService, ServiceStats};
use crate::session::{ConnectionHandle, Frame};
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Sync states pushed to peers that fell behind
    pub resyncs: u64,
}

pub struct CollabServer {
    service: Arc<CollabService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Open the configured store (RocksDB when `storage_path` is set) and
    /// build the service around it.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_service(Arc::new(CollabService::with_store(config, store))))
    }

    pub fn with_service(service: Arc<CollabService>) -> Self {
        Self {
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn service(&self) -> &Arc<CollabService> {
        &self.service
    }

    pub fn bind_addr(&self) -> &str {
        &self.service.config().bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        let maintenance = Self::spawn_maintenance(self.service.clone());

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        maintenance.abort();
        result
    }

    /// Periodically end idle sessions and unload idle rooms.
    fn spawn_maintenance(service: Arc<CollabService>) -> JoinHandle<()> {
        let period = service.config().reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                service.reap_idle_sessions().await;
                service.evict_idle_rooms().await;
            }
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<CollabService>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (conn, outbox) = ConnectionHandle::new(service.config().outbound_capacity);
        let result = Self::connection_loop(ws_stream, addr, &service, &stats, &conn, outbox).await;

        // Lost or closed: same path as an explicit leave.
        service.disconnect(conn.id()).await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr}");
        result
    }

    async fn connection_loop(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        service: &CollabService,
        stats: &RwLock<ServerStats>,
        conn: &ConnectionHandle,
        mut outbox: mpsc::Receiver<Frame>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let period = service.config().heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            let replies = Self::process(service, conn, text.as_str()).await;
                            Self::reply(&mut ws_sender, service, conn, &replies).await?;
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Binary frame from {addr} rejected");
                            let err = CollabError::Protocol(
                                crate::protocol::ProtocolError::UnsupportedFrame("binary"),
                            );
                            let replies = [ServerMessage::Error(ErrorPayload::from(&err))];
                            Self::reply(&mut ws_sender, service, conn, &replies).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = outbox.recv() => {
                    let Some(frame) = frame else { break };
                    ws_sender.send(Message::text(frame.to_string())).await?;
                    if outbox.is_empty() && conn.take_lagged() {
                        Self::push_resync(&mut ws_sender, service, stats, conn).await?;
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }

                _ = conn.closed() => {
                    log::info!("Closing connection from {addr}");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Decode one text frame and run it through the service.
    async fn process(service: &CollabService, conn: &ConnectionHandle, text: &str) -> Vec<ServerMessage> {
        let decoded = Envelope::decode(text).and_then(|envelope| {
            let claimed = envelope.session_id;
            ClientMessage::from_envelope(envelope).map(|message| (message, claimed))
        });
        let (message, claimed) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Rejected message on {}: {e}", conn.id());
                return vec![ServerMessage::Error(ErrorPayload::from(&CollabError::from(e)))];
            }
        };

        log::debug!("{} message on {}", message.kind(), conn.id());
        match service.handle(conn, message, claimed).await {
            Ok(replies) => replies,
            Err(e) => {
                log::warn!("Request on {} failed: {e}", conn.id());
                vec![ServerMessage::Error(ErrorPayload::from(&e))]
            }
        }
    }

    /// Send replies straight to the requester, tagged with its session.
    async fn reply(
        ws_sender: &mut WsSender,
        service: &CollabService,
        conn: &ConnectionHandle,
        replies: &[ServerMessage],
    ) -> Result<(), BoxError> {
        let session = service.session_for_connection(conn.id());
        for reply in replies {
            match service.frame(reply, session.as_deref()) {
                Ok(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                Err(e) => log::error!("Failed to encode {} reply: {e}", reply.kind()),
            }
        }
        Ok(())
    }

    /// Catch a lagging peer up with the full current state.
    async fn push_resync(
        ws_sender: &mut WsSender,
        service: &CollabService,
        stats: &RwLock<ServerStats>,
        conn: &ConnectionHandle,
    ) -> Result<(), BoxError> {
        let Some(session) = service.session_for_connection(conn.id()) else {
            return Ok(());
        };
        match service.state_for(session.id).await {
            Ok(state) => {
                log::warn!(
                    "Session {} fell behind; pushing state at v{}",
                    session.id,
                    state.version
                );
                let replies = [ServerMessage::Sync(SyncResponse::State(state))];
                Self::reply(ws_sender, service, conn, &replies).await?;
                stats.write().await.resyncs += 1;
            }
            Err(e) => log::error!("Could not build resync state for {}: {e}", session.id),
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub async fn service_stats(&self) -> ServiceStats {
        self.service.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_in_memory_by_default() {
        let server = CollabServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.service().list_manuscripts().unwrap().is_empty());
    }

    #[test]
    fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = CollabServer::new(config).unwrap();
        server
            .service()
            .create_manuscript(&"ms-1".into(), "Once upon a time")
            .unwrap();
        assert_eq!(server.service().list_manuscripts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::new(ServerConfig::default()).unwrap();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(server.service_stats().await.loaded_rooms, 0);
    }

    #[tokio::test]
    async fn test_process_rejects_garbage() {
        let server = CollabServer::new(ServerConfig::default()).unwrap();
        let (conn, _rx) = ConnectionHandle::new(4);
        let replies = CollabServer::process(server.service(), &conn, "not json").await;
        match replies.as_slice() {
            [ServerMessage::Error(e)] => {
                assert_eq!(e.code, crate::protocol::ErrorCode::Protocol);
                assert!(!e.retryable);
            }
            other => panic!("expected one error, got {other:?}"),
        }
    }
}
