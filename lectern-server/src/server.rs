//! WebSocket transport for live sessions.
//!
//! ```text
//! Client ──ws──► read half ── ClientAction ──► dispatch ──► Hub
//!   ▲                                                        │
//!   └──ws─── write half ◄── ChannelReceiver ◄── try_send ────┘
//! ```
//!
//! One task per connection. The handshake resolves the caller's identity
//! from the request target; after that the task joins the session, then
//! pumps inbound frames into the hub and the participant's queue out to the
//! socket until either side ends. Leaving is always reported back to the
//! hub with the connection's channel id.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use lectern_hub::audit::{AuditStore, QueuedRecorder, StoreConfig};
use lectern_hub::hub::Hub;
use lectern_hub::protocol::{ErrorCode, HubEvent, SessionId};

use crate::config::ServerConfig;
use crate::dispatch::{self, ConnectionContext};
use crate::identity::{ConnectRequest, HandshakeError, Identity, IdentityResolver, QueryIdentityResolver};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub inbound_frames: u64,
}

#[derive(Default)]
struct AtomicTransportStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    inbound_frames: AtomicU64,
}

impl AtomicTransportStats {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            inbound_frames: self.inbound_frames.load(Ordering::Relaxed),
        }
    }
}

/// The WebSocket server.
pub struct TransportServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    resolver: Arc<dyn IdentityResolver>,
    stats: Arc<AtomicTransportStats>,
}

impl TransportServer {
    pub fn new(config: ServerConfig, hub: Arc<Hub>) -> Self {
        Self {
            config,
            hub,
            resolver: Arc::new(QueryIdentityResolver),
            stats: Arc::new(AtomicTransportStats::default()),
        }
    }

    /// Build the hub from `config`, with an audit writer if a storage path
    /// is set. Must run inside a tokio runtime.
    pub fn open(config: ServerConfig) -> Result<Self, BoxError> {
        let hub = match &config.storage_path {
            Some(path) => {
                let store = AuditStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Audit log at {}", store.path().display());
                let (recorder, _writer) = QueuedRecorder::spawn(Arc::new(store), config.audit_queue);
                Hub::with_recorder(config.hub.clone(), Arc::new(recorder))
            }
            None => Hub::new(config.hub.clone()),
        };
        Ok(Self::new(config, Arc::new(hub)))
    }

    /// Replace the identity resolver (default: [`QueryIdentityResolver`]).
    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Lectern server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                hub: self.hub.clone(),
                resolver: self.resolver.clone(),
                stats: self.stats.clone(),
                auto_open_sessions: self.config.auto_open_sessions,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.handle(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

struct Connection {
    hub: Arc<Hub>,
    resolver: Arc<dyn IdentityResolver>,
    stats: Arc<AtomicTransportStats>,
    auto_open_sessions: bool,
}

impl Connection {
    async fn handle(self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let mut accepted: Option<(SessionId, Identity)> = None;
        let resolver = self.resolver.clone();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let target = request
                .uri()
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_string();
            let resolved = ConnectRequest::parse(&target)
                .and_then(|req| resolver.resolve(&req).map(|identity| (req.session_id, identity)));
            match resolved {
                Ok(found) => {
                    accepted = Some(found);
                    Ok(response)
                }
                Err(e) => {
                    log::warn!("Rejected handshake from {addr} for {target}: {e}");
                    Err(reject(&e))
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) if accepted.is_none() => {
                self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some((session_id, identity)) = accepted else {
            return Ok(());
        };

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        let result = self.run_session(ws_stream, addr, session_id, identity).await;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn run_session(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        session_id: SessionId,
        identity: Identity,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let participant_id = identity.participant_id;

        let connected = HubEvent::Connected {
            session_id,
            participant_id,
            user_id: identity.user_id,
        };
        ws_sender.send(Message::text(connected.to_json()?)).await?;

        if identity.is_teacher() && self.auto_open_sessions && self.hub.open_session(session_id).await {
            log::info!("Session {session_id} opened by teacher {}", identity.user_id);
        }

        let mut receiver = match self
            .hub
            .join(
                session_id,
                participant_id,
                identity.user_id,
                identity.name.clone(),
                identity.is_teacher(),
            )
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                log::warn!("Participant {participant_id} from {addr} could not join session {session_id}: {e}");
                let error = HubEvent::error(e.code(), e.to_string());
                ws_sender.send(Message::text(error.to_json()?)).await?;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
        };
        let channel_id = receiver.id();
        let ctx = ConnectionContext::new(session_id, identity);
        log::info!(
            "Participant {participant_id} ({}) joined session {session_id} from {addr}",
            ctx.identity.name
        );

        let outcome: Result<(), BoxError> = loop {
            tokio::select! {
                inbound = ws_receiver.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        self.stats.inbound_frames.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Session {session_id}: frame from {participant_id}: {}", text.as_str());
                        dispatch::handle_text(&self.hub, &ctx, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let error = HubEvent::error(ErrorCode::BadRequest, "binary frames are not supported");
                        let _ = self.hub.send_to(session_id, participant_id, error).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Ok(());
                    }
                },

                outbound = receiver.recv() => match outbound {
                    Some(frame) => {
                        log::trace!("Session {session_id}: {} to {participant_id}", frame.kind());
                        if let Err(e) = ws_sender.send(Message::text(frame.json().to_string())).await {
                            break Err(e.into());
                        }
                    }
                    None => {
                        log::debug!("Channel {channel_id} closed by the hub, closing socket to {addr}");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break Ok(());
                    }
                },
            }
        };

        self.hub.leave(session_id, participant_id, channel_id).await;
        outcome
    }
}

fn reject(error: &HandshakeError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::BAD_REQUEST);
    response
}
