//! Per-editor collaboration session.
//!
//! Owns the buffer, transport, applier and presence tracker, and wires them
//! to the host's edit hooks and frame tick:
//!
//! ```text
//! host hooks ──► on_* ──► ChangeBuffer ──tick──► TransportClient ──► relay
//!                                                      │
//! host tree ◄── ChangeApplier ◄── ReplayGuard ◄── poll()
//!                                                      │
//!                                  PresenceTracker ◄───┘
//! ```
//!
//! Host hooks are ignored while a remote batch is being replayed, so
//! applied changes are never echoed back.

use std::time::Duration;

use tokio::runtime::Handle;

use crate::apply::{ApplyReport, ChangeApplier, ReplayFlag};
use crate::buffer::ChangeBuffer;
use crate::client::{ConnectionState, TransportClient, TransportEvent};
use crate::config::ClientConfig;
use crate::presence::PresenceTracker;
use crate::protocol::{Change, ProtocolError};
use crate::tree::TreeAccessor;

/// Tool name reported with selection changes.
pub const SELECT_TOOL: &str = "select";

/// What happened during one [`CollabSession::tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub connected: bool,
    pub disconnected: bool,
    /// One entry per remote batch replayed
    pub applied: Vec<ApplyReport>,
    pub presence_updates: usize,
    /// Sequence number of the batch flushed this tick, if any
    pub sent_batch: Option<i64>,
}

pub struct CollabSession {
    config: ClientConfig,
    buffer: ChangeBuffer,
    transport: TransportClient,
    applier: ChangeApplier,
    presence: PresenceTracker,
    replay: ReplayFlag,
    selected: Option<String>,
}

impl CollabSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            buffer: ChangeBuffer::new(config.batch_interval),
            transport: TransportClient::new(config.user_id.clone()),
            applier: ChangeApplier::new(config.coercion),
            presence: PresenceTracker::new(),
            replay: ReplayFlag::new(),
            selected: None,
            config,
        }
    }

    /// Drive the socket on an explicit runtime.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.transport = self.transport.with_runtime(runtime);
        self
    }

    /// Start connecting to the configured relay.
    pub fn connect(&mut self) -> Result<(), ProtocolError> {
        self.transport.connect(&self.config.server_url)
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.buffer.clear();
    }

    /// Run one frame: replay inbound traffic, then flush local edits.
    pub fn tick<T: TreeAccessor>(&mut self, elapsed: Duration, tree: &mut T) -> TickReport {
        let mut report = TickReport::default();

        for event in self.transport.poll() {
            match event {
                TransportEvent::Connected => report.connected = true,
                TransportEvent::Disconnected => {
                    report.disconnected = true;
                    self.presence.clear();
                    self.buffer.clear();
                }
                TransportEvent::BatchReceived(batch) => match self.replay.enter() {
                    Some(guard) => {
                        report
                            .applied
                            .push(self.applier.apply_batch(&guard, tree, &batch));
                    }
                    None => log::error!(
                        "Replay already in progress, dropping batch {} from {}",
                        batch.batch_id,
                        batch.origin
                    ),
                },
                TransportEvent::PresenceReceived { user, presence } => {
                    log::trace!("Presence from {user}");
                    self.presence.update(presence);
                    report.presence_updates += 1;
                }
            }
        }

        if let Some(batch) = self.buffer.tick(elapsed) {
            match self.transport.send_batch(&batch) {
                Ok(sent) => report.sent_batch = sent,
                Err(e) => log::error!("Failed to send batch: {e}"),
            }
        }

        report
    }

    /// Host hook: selection changed. Sends presence immediately.
    pub fn on_selection_changed(&mut self, path: Option<&str>) {
        if self.replay.is_active() {
            return;
        }
        self.selected = path.map(str::to_string);
        if let Err(e) = self.transport.send_presence(path, SELECT_TOOL) {
            log::error!("Failed to send presence: {e}");
        }
    }

    /// Host hook: a property of the selected node was edited.
    ///
    /// The new value is read back from `tree`. Returns whether a change was
    /// enqueued.
    pub fn on_property_edited<T: TreeAccessor>(&mut self, tree: &T, property: &str) -> bool {
        if self.replay.is_active() {
            return false;
        }
        let Some(path) = self.selected.as_deref() else {
            return false;
        };
        let Some(value) = tree
            .resolve(path)
            .and_then(|node| tree.get_property(&node, property))
        else {
            log::debug!("Cannot read {path}.{property}, edit not replicated");
            return false;
        };

        self.buffer.enqueue(Change::SetProperty {
            node_path: path.to_string(),
            property_name: property.to_string(),
            value: value.to_json(),
        });
        true
    }

    /// Host hook: a node was instanced from `resource_reference` under `parent_path`.
    pub fn on_node_added(&mut self, parent_path: &str, name: &str, resource_reference: &str) -> bool {
        self.enqueue(Change::AddNode {
            parent_path: parent_path.to_string(),
            child_name: name.to_string(),
            resource_reference: resource_reference.to_string(),
        })
    }

    /// Host hook: a node was deleted.
    pub fn on_node_removed(&mut self, path: &str) -> bool {
        if !self.enqueue(Change::RemoveNode {
            node_path: path.to_string(),
        }) {
            return false;
        }
        if self.selected.as_deref() == Some(path) {
            self.selected = None;
        }
        true
    }

    /// Handle to the replay flag, for host hooks that fire during replay.
    pub fn replay_flag(&self) -> ReplayFlag {
        self.replay.clone()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn selected_path(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn pending_changes(&self) -> usize {
        self.buffer.pending_count()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn enqueue(&mut self, change: Change) -> bool {
        if self.replay.is_active() {
            return false;
        }
        self.buffer.enqueue(change);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MemoryTree;
    use crate::value::PropertyValue;

    fn session() -> CollabSession {
        CollabSession::new(ClientConfig {
            user_id: "A".to_string(),
            ..ClientConfig::default()
        })
    }

    fn scene() -> MemoryTree {
        let mut tree = MemoryTree::new("root");
        tree.insert_node("/root", "Box", [("visible", PropertyValue::Bool(true))])
            .unwrap();
        tree
    }

    #[test]
    fn test_property_edit_requires_selection() {
        let mut session = session();
        let tree = scene();
        assert!(!session.on_property_edited(&tree, "visible"));

        session.on_selection_changed(Some("/root/Box"));
        assert!(session.on_property_edited(&tree, "visible"));
        assert!(!session.on_property_edited(&tree, "missing"));
        assert_eq!(session.pending_changes(), 1);
    }

    #[test]
    fn test_hooks_ignored_during_replay() {
        let mut session = session();
        let tree = scene();
        session.on_selection_changed(Some("/root/Box"));

        let flag = session.replay_flag();
        let guard = flag.enter().unwrap();
        assert!(!session.on_property_edited(&tree, "visible"));
        assert!(!session.on_node_removed("/root/Box"));
        assert!(!session.on_node_added("/root", "Lamp", "res://lamp.tscn"));
        session.on_selection_changed(None);
        assert_eq!(session.selected_path(), Some("/root/Box"));
        drop(guard);

        assert!(session.on_node_removed("/root/Box"));
        assert_eq!(session.selected_path(), None);
        assert_eq!(session.pending_changes(), 1);
    }

    #[test]
    fn test_tick_offline_drops_batches() {
        let mut session = session();
        let mut tree = scene();
        session.on_node_added("/root", "Lamp", "res://lamp.tscn");

        let report = session.tick(Duration::from_millis(60), &mut tree);
        assert_eq!(report.sent_batch, None);
        assert_eq!(session.pending_changes(), 0);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }
}
