//! Time-windowed accumulation of local edits.
//!
//! Edits are appended as they happen and flushed as one [`Batch`] once the
//! batch interval has elapsed, so bursts of edits (dragging a gizmo, typing
//! into a field) go out as a single frame.

use std::time::Duration;

use crate::protocol::{Batch, Change};

/// Default flush interval.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Pending local changes plus the elapsed-time accumulator.
#[derive(Debug, Clone)]
pub struct ChangeBuffer {
    pending: Vec<Change>,
    elapsed: Duration,
    interval: Duration,
}

impl ChangeBuffer {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: Vec::new(),
            elapsed: Duration::ZERO,
            interval,
        }
    }

    /// Append a change. No deduplication or coalescing.
    pub fn enqueue(&mut self, change: Change) {
        self.pending.push(change);
    }

    /// Advance the accumulator by `elapsed`.
    ///
    /// Returns a batch when the accumulated time has reached the interval
    /// and at least one change is pending. At most one batch is produced per
    /// call however far past the interval the accumulator has run. While the
    /// queue is empty the accumulator keeps growing, so the next enqueued
    /// change is flushed on the following tick.
    pub fn tick(&mut self, elapsed: Duration) -> Option<Batch> {
        self.elapsed = self.elapsed.saturating_add(elapsed);
        if self.elapsed < self.interval || self.pending.is_empty() {
            return None;
        }

        self.elapsed = Duration::ZERO;
        let changes = std::mem::take(&mut self.pending);
        log::trace!("Flushing {} buffered changes", changes.len());
        Some(Batch::new(changes))
    }

    /// Drop pending changes and reset the accumulator.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.elapsed = Duration::ZERO;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for ChangeBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_INTERVAL)
    }
}
