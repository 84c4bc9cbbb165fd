//! # duet-sync: Live edit mirroring between two editors
//!
//! Replicates scene-tree edits between exactly two editor instances through
//! a dumb WebSocket relay. Last write wins; there is no history, no conflict
//! resolution and no persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ CollabSession│ ◄────────────────► │ RelayServer │ ◄────────────────► │ CollabSession│
//! │ (editor A)   │    JSON envelopes  │ (2 slots)   │    JSON envelopes  │ (editor B)   │
//! └──────┬───────┘                    └─────────────┘                    └──────┬───────┘
//!        │                                                                      │
//!        ▼                                                                      ▼
//! ┌──────────────┐                                                      ┌──────────────┐
//! │ TreeAccessor │                                                      │ TreeAccessor │
//! │ (host tree)  │                                                      │ (host tree)  │
//! └──────────────┘                                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelope codec and change records
//! - [`value`]: Typed property values and geometric coercion
//! - [`buffer`]: Time-windowed batching of local edits
//! - [`client`]: Non-blocking WebSocket transport with echo suppression
//! - [`apply`]: Fault-isolated replay of remote batches
//! - [`tree`]: Host tree capability and an in-memory implementation
//! - [`presence`]: Remote selection tracking
//! - [`pair`]: Two-slot relay session
//! - [`relay`]: WebSocket relay server
//! - [`session`]: Per-editor glue driven by the host's frame tick
//! - [`config`]: Client and relay configuration

pub mod apply;
pub mod buffer;
pub mod client;
pub mod config;
pub mod pair;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod tree;
pub mod value;

// Re-exports for convenience
pub use apply::{ApplyError, ApplyReport, ChangeApplier, ReplayFlag, ReplayGuard, SkippedChange};
pub use buffer::ChangeBuffer;
pub use client::{ConnectionState, TransportClient, TransportEvent};
pub use config::{ClientConfig, RelayConfig};
pub use pair::{AdmissionError, ConnectionId, PairSession, SessionState, MAX_PEERS};
pub use presence::PresenceTracker;
pub use protocol::{Batch, Change, Envelope, Presence, ProtocolError, ReceivedBatch};
pub use relay::{RelayServer, RelayStats};
pub use session::{CollabSession, TickReport};
pub use tree::{MemoryTree, NodeId, ResourceTemplate, TreeAccessor, TreeError};
pub use value::{PropertyValue, ValueCoercion};
