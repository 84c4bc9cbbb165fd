//! Two-slot relay session.
//!
//! The relay pairs exactly two connections. Each slot holds the sending
//! half of a connection's outbound channel; forwarding is always "send to
//! the other slot".
//!
//! ```text
//!  Idle ──admit──► WaitingForPeer ──admit──► Paired
//!   ▲                 │      ▲                 │
//!   └────release──────┘      └────release──────┘
//!
//!  admit while Paired ─► AdmissionError::SessionFull (close 1008)
//! ```

use uuid::Uuid;

/// Maximum number of simultaneous connections.
pub const MAX_PEERS: usize = 2;

/// Relay-assigned identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Occupancy of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitingForPeer,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Maximum clients reached")]
    SessionFull,
}

#[derive(Debug)]
struct Slot<T> {
    id: ConnectionId,
    sender: T,
}

/// The pairing table. `T` is whatever handle reaches a connection's writer.
#[derive(Debug)]
pub struct PairSession<T> {
    slots: [Option<Slot<T>>; MAX_PEERS],
}

impl<T> PairSession<T> {
    pub fn new() -> Self {
        Self { slots: [None, None] }
    }

    /// Take a free slot.
    pub fn admit(&mut self, sender: T) -> Result<ConnectionId, AdmissionError> {
        let free = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(AdmissionError::SessionFull)?;

        let id = ConnectionId::new();
        *free = Some(Slot { id, sender });
        Ok(id)
    }

    /// Vacate the slot held by `id`. Returns whether it was present.
    pub fn release(&mut self, id: ConnectionId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.slots[index] = None;
                true
            }
            None => false,
        }
    }

    /// Handle of the other connection, only while paired.
    pub fn counterpart(&self, id: ConnectionId) -> Option<&T> {
        let index = self.position(id)?;
        self.slots[1 - index].as_ref().map(|slot| &slot.sender)
    }

    pub fn state(&self) -> SessionState {
        match self.len() {
            0 => SessionState::Idle,
            1 => SessionState::WaitingForPeer,
            _ => SessionState::Paired,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: ConnectionId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.id == id))
    }
}

impl<T> Default for PairSession<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let mut session = PairSession::new();
        assert_eq!(session.state(), SessionState::Idle);

        let a = session.admit("a").unwrap();
        assert_eq!(session.state(), SessionState::WaitingForPeer);

        let b = session.admit("b").unwrap();
        assert_eq!(session.state(), SessionState::Paired);

        assert!(session.release(a));
        assert_eq!(session.state(), SessionState::WaitingForPeer);
        assert!(session.release(b));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_third_connection_rejected() {
        let mut session = PairSession::new();
        session.admit(1).unwrap();
        session.admit(2).unwrap();
        assert_eq!(session.admit(3), Err(AdmissionError::SessionFull));
        assert_eq!(session.len(), MAX_PEERS);
    }

    #[test]
    fn test_counterpart_only_when_paired() {
        let mut session = PairSession::new();
        let a = session.admit("a").unwrap();
        assert_eq!(session.counterpart(a), None);

        let b = session.admit("b").unwrap();
        assert_eq!(session.counterpart(a), Some(&"b"));
        assert_eq!(session.counterpart(b), Some(&"a"));

        session.release(b);
        assert_eq!(session.counterpart(a), None);
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut session = PairSession::new();
        let a = session.admit("a").unwrap();
        let b = session.admit("b").unwrap();
        session.release(a);

        let c = session.admit("c").unwrap();
        assert!(session.contains(c));
        assert!(!session.contains(a));
        assert_eq!(session.counterpart(b), Some(&"c"));
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut session: PairSession<()> = PairSession::new();
        assert!(!session.release(ConnectionId::new()));
        assert!(session.is_empty());
    }
}
