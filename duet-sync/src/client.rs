//! WebSocket transport client for the relay.
//!
//! Provides:
//! - Non-blocking connection lifecycle (connect, disconnect)
//! - Batch and presence sends with per-client sequence numbers
//! - Cooperative `poll()` that drains inbound frames into events
//! - Echo suppression of envelopes carrying our own user id
//!
//! The socket runs on a background tokio task. The owning side only ever
//! touches channels, so `poll()` and the send calls never block and can be
//! driven from a host's frame tick.

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Batch, Envelope, Presence, ProtocolError, ReceivedBatch};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced by [`TransportClient::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed locally
    Disconnected,
    /// Change records from the remote peer, in arrival order
    BatchReceived(ReceivedBatch),
    /// Remote selection/tool update
    PresenceReceived { user: String, presence: Presence },
}

/// Messages from the socket task to the polling side.
#[derive(Debug)]
enum Inbound {
    Opened,
    Frame(String),
    Failed(String),
    Closed,
}

/// The transport client.
///
/// One instance per editing user. Outgoing frames are dropped, not queued,
/// while disconnected.
pub struct TransportClient {
    /// Identity stamped on every outgoing envelope
    user_id: String,

    /// Sequence number for the next outgoing batch
    next_batch_id: i64,

    state: ConnectionState,

    /// Runtime that drives the socket task; falls back to the ambient one
    runtime: Option<Handle>,

    /// Channel to the socket writer
    outgoing_tx: Option<mpsc::UnboundedSender<Message>>,

    /// Channel from the socket reader
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,

    /// Events produced outside `poll()` (local disconnect)
    pending_events: Vec<TransportEvent>,
}

impl TransportClient {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            next_batch_id: 0,
            state: ConnectionState::Disconnected,
            runtime: None,
            outgoing_tx: None,
            inbound_rx: None,
            pending_events: Vec::new(),
        }
    }

    /// Use an explicit runtime, for hosts whose tick runs outside tokio.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Start connecting to `url`.
    ///
    /// Returns as soon as the socket task is spawned. The outcome arrives
    /// through `poll()` as [`TransportEvent::Connected`], or as a logged
    /// failure that returns the client to `Disconnected`. Any previous
    /// connection is closed first.
    pub fn connect(&mut self, url: &str) -> Result<(), ProtocolError> {
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| ProtocolError::NoRuntime)?,
        };

        self.disconnect();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.outgoing_tx = Some(out_tx);
        self.inbound_rx = Some(in_rx);
        self.state = ConnectionState::Connecting;

        log::info!("Connecting to {url} as {}", self.user_id);
        runtime.spawn(run_connection(url.to_string(), out_rx, in_tx));
        Ok(())
    }

    /// Drain everything that arrived since the last call.
    pub fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = std::mem::take(&mut self.pending_events);

        loop {
            let Some(rx) = self.inbound_rx.as_mut() else {
                break;
            };
            let inbound = match rx.try_recv() {
                Ok(inbound) => inbound,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => Inbound::Closed,
            };

            match inbound {
                Inbound::Opened => {
                    self.state = ConnectionState::Connected;
                    log::info!("Connected as {}", self.user_id);
                    events.push(TransportEvent::Connected);
                }
                Inbound::Frame(text) => {
                    Self::dispatch_frame(&self.user_id, &text, &mut events);
                }
                Inbound::Failed(reason) => {
                    log::warn!("Connection failed: {reason}");
                    self.reset();
                }
                Inbound::Closed => {
                    if self.state == ConnectionState::Connected {
                        log::info!("Disconnected from relay");
                        events.push(TransportEvent::Disconnected);
                    }
                    self.reset();
                }
            }
        }

        events
    }

    /// Send a batch of local changes.
    ///
    /// Returns the sequence number used, or `None` when not connected.
    pub fn send_batch(&mut self, batch: &Batch) -> Result<Option<i64>, ProtocolError> {
        if self.state != ConnectionState::Connected {
            log::debug!("Not connected, dropping batch of {} changes", batch.len());
            return Ok(None);
        }

        let batch_id = self.next_batch_id;
        let text = Envelope::for_batch(&self.user_id, batch_id, batch)?.encode()?;
        self.send_text(text)?;
        self.next_batch_id += 1;

        log::trace!("Sent batch {batch_id} ({} changes)", batch.len());
        Ok(Some(batch_id))
    }

    /// Send a presence update immediately. Returns whether it was sent.
    pub fn send_presence(
        &mut self,
        selected_path: Option<&str>,
        tool_name: &str,
    ) -> Result<bool, ProtocolError> {
        if self.state != ConnectionState::Connected {
            return Ok(false);
        }

        let presence = Presence::new(selected_path.unwrap_or_default(), tool_name);
        let text = Envelope::for_presence(&self.user_id, &presence).encode()?;
        self.send_text(text)?;
        Ok(true)
    }

    /// Close the connection. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Connected {
            log::info!("Disconnecting {}", self.user_id);
            self.pending_events.push(TransportEvent::Disconnected);
        }
        self.reset();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Sequence number the next batch will carry.
    pub fn next_batch_id(&self) -> i64 {
        self.next_batch_id
    }

    fn send_text(&mut self, text: String) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Drop both channel ends. The socket task sees its outgoing channel
    /// close, sends a close frame and exits.
    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.outgoing_tx = None;
        self.inbound_rx = None;
    }

    /// Decode one frame and translate it into events.
    fn dispatch_frame(user_id: &str, text: &str, events: &mut Vec<TransportEvent>) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Discarding malformed frame: {e}");
                return;
            }
        };

        // Skip our own messages
        if envelope.user == user_id {
            log::trace!("Ignoring echo of batch {}", envelope.batch_id);
            return;
        }

        if envelope.is_newer_version() {
            log::warn!(
                "Peer {} speaks protocol version {:?}, processing anyway",
                envelope.user,
                envelope.version
            );
        }

        let origin = envelope.user.clone();
        let batch_id = envelope.batch_id;
        let (presence, records) = envelope.split();

        events.extend(presence.into_iter().map(|presence| TransportEvent::PresenceReceived {
            user: origin.clone(),
            presence,
        }));

        if !records.is_empty() {
            events.push(TransportEvent::BatchReceived(ReceivedBatch {
                origin,
                batch_id,
                records,
            }));
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Socket task: owns the WebSocket for one connection attempt.
async fn run_connection(
    url: String,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    in_tx: mpsc::UnboundedSender<Inbound>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let _ = in_tx.send(Inbound::Failed(format!("{url}: {e}")));
            return;
        }
    };
    let _ = in_tx.send(Inbound::Opened);

    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(msg) => {
                    if let Err(e) = ws_writer.send(msg).await {
                        log::error!("WebSocket send error: {e}");
                        break;
                    }
                }
                None => {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    break;
                }
            },

            incoming = ws_reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = in_tx.send(Inbound::Frame(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        let _ = in_tx.send(Inbound::Frame(text));
                    }
                    Err(_) => log::warn!("Discarding non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        log::info!(
                            "Relay closed the connection: {} {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        );
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("WebSocket receive error: {e}");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = in_tx.send(Inbound::Closed);
}
