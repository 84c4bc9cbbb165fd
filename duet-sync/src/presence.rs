//! Remote peer awareness: what the other user has selected and which tool
//! they are using.
//!
//! Presence is last-writer-wins. Every update replaces the previous state;
//! there is no history and no interpolation.

use crate::protocol::Presence;

/// Latest presence state reported by the remote peer.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    current: Presence,
    updates: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored state unconditionally.
    pub fn update(&mut self, presence: Presence) {
        if presence != self.current {
            log::debug!(
                "Remote selection: {} (tool: {})",
                presence.selected().unwrap_or("<none>"),
                presence.tool_name
            );
        }
        self.current = presence;
        self.updates += 1;
    }

    /// Forget the remote state, e.g. after the peer went away.
    pub fn clear(&mut self) {
        if !self.is_empty() {
            log::info!("Clearing remote presence");
        }
        self.current = Presence::default();
    }

    /// Path the remote peer has selected, if any.
    pub fn selected_path(&self) -> Option<&str> {
        self.current.selected()
    }

    pub fn tool(&self) -> &str {
        &self.current.tool_name
    }

    pub fn snapshot(&self) -> Presence {
        self.current.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.current == Presence::default()
    }

    /// Number of updates received since creation.
    pub fn update_count(&self) -> u64 {
        self.updates
    }
}
