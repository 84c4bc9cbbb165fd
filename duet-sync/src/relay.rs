//! WebSocket relay pairing two editors.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌──► Client B
//!            ├── PairSession (2 slots)┤
//! Client B ──┘                       └──► Client A
//!
//! Client C ──► accept ──► SessionFull ──► Close(1008)
//! ```
//!
//! The relay never inspects payloads. Every text or binary frame from one
//! slot is forwarded verbatim to the other slot; frames arriving while only
//! one client is connected are dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::pair::{AdmissionError, PairSession, SessionState};

const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Outbound = mpsc::UnboundedSender<Message>;
type SharedSession = Arc<Mutex<PairSession<Outbound>>>;

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub forwarded_messages: u64,
    pub forwarded_bytes: u64,
    pub dropped_messages: u64,
}

/// Lock-free counters behind [`RelayStats`].
#[derive(Debug, Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    forwarded_messages: AtomicU64,
    forwarded_bytes: AtomicU64,
    dropped_messages: AtomicU64,
}

impl AtomicRelayStats {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            forwarded_messages: self.forwarded_messages.load(Ordering::Relaxed),
            forwarded_bytes: self.forwarded_bytes.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    session: SharedSession,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(PairSession::new())),
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let session = self.session.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, session, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot()
    }

    pub async fn session_state(&self) -> SessionState {
        self.session.lock().await.state()
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        session: SharedSession,
        stats: Arc<AtomicRelayStats>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let admitted = {
            let mut session = session.lock().await;
            session.admit(out_tx).map(|id| (id, session.state()))
        };
        let id = match admitted {
            Ok((id, state)) => {
                log::info!("Client {id} connected from {addr} ({state:?})");
                id
            }
            Err(AdmissionError::SessionFull) => {
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejecting {addr}: {}", AdmissionError::SessionFull);
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: AdmissionError::SessionFull.to_string().into(),
                };
                ws_sender.send(Message::Close(Some(frame))).await?;
                // Let the close handshake finish before dropping the socket.
                let drain = async { while let Some(Ok(_)) = ws_receiver.next().await {} };
                let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, drain).await;
                return Ok(());
            }
        };

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                            let len = msg.len() as u64;
                            let session = session.lock().await;
                            let delivered = session
                                .counterpart(id)
                                .is_some_and(|peer| peer.send(msg).is_ok());
                            drop(session);

                            if delivered {
                                stats.forwarded_messages.fetch_add(1, Ordering::Relaxed);
                                stats.forwarded_bytes.fetch_add(len, Ordering::Relaxed);
                                log::trace!("Forwarded {len} bytes from {id}");
                            } else {
                                stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
                                log::debug!("No peer for {id}, dropped {len} bytes");
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::warn!("Failed to answer ping from {id}: {e}");
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {id}: {e}");
                            break;
                        }
                    }
                }

                // Frames forwarded from the other slot
                outgoing = out_rx.recv() => {
                    let Some(msg) = outgoing else { break };
                    if let Err(e) = ws_sender.send(msg).await {
                        log::warn!("Failed to deliver to {id}: {e}");
                        break;
                    }
                }
            }
        }

        let remaining = {
            let mut session = session.lock().await;
            session.release(id);
            session.state()
        };
        log::info!("Client {id} disconnected ({remaining:?})");
        Ok(())
    }
}
