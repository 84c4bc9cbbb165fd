//! Replays remote batches onto the local document tree.
//!
//! ```text
//! ReceivedBatch ──► ReplayFlag::enter() ──► ChangeApplier::apply_batch()
//!                         │                        │
//!                    ReplayGuard              per record:
//!                  (held for batch)     decode ─► dispatch ─► TreeAccessor
//!                                               │
//!                                          failure ─► warn + skip
//! ```
//!
//! Each change is isolated: a record that fails to decode, resolve or apply
//! is reported and skipped while the rest of the batch continues. While the
//! guard is held, host edit hooks must not enqueue outgoing changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::protocol::{Change, ProtocolError, ReceivedBatch};
use crate::tree::{TreeAccessor, TreeError};
use crate::value::{PropertyValue, ValueCoercion};

// ───────────────────────────────────────────────────────────────────
// Reentrancy flag
// ───────────────────────────────────────────────────────────────────

/// Shared "currently replaying remote changes" flag.
#[derive(Debug, Clone, Default)]
pub struct ReplayFlag {
    active: Arc<AtomicBool>,
}

impl ReplayFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the flag. Returns `None` if a replay is already in progress.
    pub fn enter(&self) -> Option<ReplayGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReplayGuard {
                active: self.active.clone(),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Holds the replay flag; releases it on drop, including during unwinding.
#[derive(Debug)]
pub struct ReplayGuard {
    active: Arc<AtomicBool>,
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors and reports
// ───────────────────────────────────────────────────────────────────

/// Why a single change was skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error("Malformed change record: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Parent not found: {0}")]
    ParentNotFound(String),
    #[error("Property set failed on {node}.{property}: {source}")]
    PropertySetFailed {
        node: String,
        property: String,
        source: TreeError,
    },
    #[error("Failed to load resource '{reference}': {source}")]
    ResourceLoadFailed { reference: String, source: TreeError },
    #[error("Failed to attach '{name}' under {parent}: {source}")]
    AttachFailed {
        parent: String,
        name: String,
        source: TreeError,
    },
    #[error("Failed to remove {node}: {source}")]
    RemoveFailed { node: String, source: TreeError },
}

/// A change that was not applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedChange {
    /// Position of the record in the batch.
    pub index: usize,
    pub error: ApplyError,
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub batch_id: i64,
    pub applied: usize,
    pub skipped: Vec<SkippedChange>,
}

impl ApplyReport {
    pub fn attempted(&self) -> usize {
        self.applied + self.skipped.len()
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Applier
// ───────────────────────────────────────────────────────────────────

/// Dispatches decoded changes onto a [`TreeAccessor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeApplier {
    coercion: ValueCoercion,
}

impl ChangeApplier {
    pub fn new(coercion: ValueCoercion) -> Self {
        Self { coercion }
    }

    pub fn coercion(&self) -> ValueCoercion {
        self.coercion
    }

    /// Apply every record of `batch` in order.
    ///
    /// Requires a held [`ReplayGuard`] so the caller cannot forget to
    /// suppress re-broadcast of the changes being replayed.
    pub fn apply_batch<T: TreeAccessor>(
        &self,
        _guard: &ReplayGuard,
        tree: &mut T,
        batch: &ReceivedBatch,
    ) -> ApplyReport {
        let mut report = ApplyReport {
            batch_id: batch.batch_id,
            ..ApplyReport::default()
        };

        for (index, record) in batch.records.iter().enumerate() {
            let result = Change::from_record(record)
                .map_err(ApplyError::from)
                .and_then(|change| self.apply_change(tree, &change));

            match result {
                Ok(()) => report.applied += 1,
                Err(error) => {
                    log::warn!(
                        "Skipping change {index} of batch {} from {}: {error}",
                        batch.batch_id,
                        batch.origin
                    );
                    report.skipped.push(SkippedChange { index, error });
                }
            }
        }

        log::debug!(
            "Applied batch {} from {}: {} ok, {} skipped",
            batch.batch_id,
            batch.origin,
            report.applied,
            report.skipped.len()
        );
        report
    }

    /// Apply a single change.
    pub fn apply_change<T: TreeAccessor>(
        &self,
        tree: &mut T,
        change: &Change,
    ) -> Result<(), ApplyError> {
        match change {
            Change::SetProperty {
                node_path,
                property_name,
                value,
            } => {
                let node = tree
                    .resolve(node_path)
                    .ok_or_else(|| ApplyError::NodeNotFound(node_path.clone()))?;
                let value = PropertyValue::from_json(value, self.coercion);
                tree.set_property(&node, property_name, value)
                    .map_err(|source| ApplyError::PropertySetFailed {
                        node: node_path.clone(),
                        property: property_name.clone(),
                        source,
                    })
            }

            Change::AddNode {
                parent_path,
                child_name,
                resource_reference,
            } => {
                let parent = tree
                    .resolve(parent_path)
                    .ok_or_else(|| ApplyError::ParentNotFound(parent_path.clone()))?;
                let resource = tree.load_resource(resource_reference).map_err(|source| {
                    ApplyError::ResourceLoadFailed {
                        reference: resource_reference.clone(),
                        source,
                    }
                })?;

                let attach_failed = |source| ApplyError::AttachFailed {
                    parent: parent_path.clone(),
                    name: child_name.clone(),
                    source,
                };
                let child = tree.instantiate(&resource);
                if let Err(source) = tree.attach(&parent, &child, child_name) {
                    // Never attached, so it must not linger.
                    if let Err(e) = tree.schedule_destroy(&child) {
                        log::debug!("Could not discard unattached instance: {e}");
                    }
                    return Err(attach_failed(source));
                }
                tree.mark_owned(&child).map_err(attach_failed)
            }

            Change::RemoveNode { node_path } => {
                let node = tree
                    .resolve(node_path)
                    .ok_or_else(|| ApplyError::NodeNotFound(node_path.clone()))?;
                tree.schedule_destroy(&node)
                    .map_err(|source| ApplyError::RemoveFailed {
                        node: node_path.clone(),
                        source,
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{MemoryTree, ResourceTemplate};
    use serde_json::{json, Value};

    fn scene() -> MemoryTree {
        let mut tree = MemoryTree::new("root");
        tree.insert_node(
            "/root",
            "Box",
            [
                ("visible", PropertyValue::Bool(true)),
                ("position", PropertyValue::Vector3([0.0; 3])),
                ("points", PropertyValue::List(Vec::new())),
            ],
        )
        .unwrap();
        tree.register_resource(
            "res://lamp.tscn",
            ResourceTemplate::new().with_property("energy", 1.0),
        );
        tree
    }

    fn batch(records: Vec<Value>) -> ReceivedBatch {
        ReceivedBatch {
            origin: "peer".to_string(),
            batch_id: 7,
            records,
        }
    }

    fn apply(tree: &mut MemoryTree, records: Vec<Value>) -> ApplyReport {
        let flag = ReplayFlag::new();
        let guard = flag.enter().unwrap();
        ChangeApplier::default().apply_batch(&guard, tree, &batch(records))
    }

    #[test]
    fn test_replay_flag_is_exclusive() {
        let flag = ReplayFlag::new();
        let guard = flag.enter().unwrap();
        assert!(flag.is_active());
        assert!(flag.clone().enter().is_none());

        drop(guard);
        assert!(!flag.is_active());
        assert!(flag.enter().is_some());
    }

    #[test]
    fn test_replay_flag_released_on_panic() {
        let flag = ReplayFlag::new();
        let inner = flag.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = inner.enter().unwrap();
            panic!("handler blew up");
        });
        assert!(result.is_err());
        assert!(!flag.is_active());
    }

    #[test]
    fn test_set_property() {
        let mut tree = scene();
        let report = apply(
            &mut tree,
            vec![json!({"type": "set_property", "node": "/root/Box", "property": "visible", "value": false})],
        );
        assert_eq!(report.applied, 1);
        assert!(report.is_clean());
        assert_eq!(tree.property_at("/root/Box", "visible"), Some(PropertyValue::Bool(false)));
    }

    #[test]
    fn test_set_property_coerces_vectors() {
        let mut tree = scene();
        apply(
            &mut tree,
            vec![json!({"type": "set_property", "node": "/root/Box", "property": "position", "value": [1, 2, 3]})],
        );
        assert_eq!(
            tree.property_at("/root/Box", "position"),
            Some(PropertyValue::Vector3([1.0, 2.0, 3.0]))
        );
    }

    #[test]
    fn test_tagged_only_leaves_arrays_alone() {
        let mut tree = scene();
        let flag = ReplayFlag::new();
        let guard = flag.enter().unwrap();
        let applier = ChangeApplier::new(ValueCoercion::TaggedOnly);

        let report = applier.apply_batch(
            &guard,
            &mut tree,
            &batch(vec![
                json!({"type": "set_property", "node": "/root/Box", "property": "points", "value": [1, 2]}),
                json!({"type": "set_property", "node": "/root/Box", "property": "position", "value": [1, 2, 3]}),
            ]),
        );
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped[0].index, 1);
        assert!(matches!(report.skipped[0].error, ApplyError::PropertySetFailed { .. }));
    }

    #[test]
    fn test_unresolved_change_does_not_abort_batch() {
        let mut tree = scene();
        let report = apply(
            &mut tree,
            vec![
                json!({"type": "set_property", "node": "/root/Ghost", "property": "visible", "value": false}),
                json!({"type": "set_property", "node": "/root/Box", "property": "visible", "value": false}),
            ],
        );
        assert_eq!(report.applied, 1);
        assert_eq!(report.attempted(), 2);
        assert_eq!(
            report.skipped,
            vec![SkippedChange {
                index: 0,
                error: ApplyError::NodeNotFound("/root/Ghost".to_string()),
            }]
        );
        assert_eq!(tree.property_at("/root/Box", "visible"), Some(PropertyValue::Bool(false)));
    }

    #[test]
    fn test_unknown_and_malformed_records_are_skipped() {
        let mut tree = scene();
        let report = apply(
            &mut tree,
            vec![
                json!({"type": "rename_node", "node": "/root/Box"}),
                json!({"node": "/root/Box"}),
                json!({"type": "remove_node"}),
                json!({"type": "remove_node", "node": "/root/Box"}),
            ],
        );
        assert_eq!(report.applied, 1);
        let errors: Vec<_> = report.skipped.iter().map(|s| &s.error).collect();
        assert_eq!(
            errors[0],
            &ApplyError::Protocol(ProtocolError::UnknownChangeType("rename_node".to_string()))
        );
        assert_eq!(errors[1], &ApplyError::Protocol(ProtocolError::MissingField("type")));
        assert!(matches!(errors[2], ApplyError::Protocol(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_add_node() {
        let mut tree = scene();
        let report = apply(
            &mut tree,
            vec![json!({"type": "add_node", "parent": "/root/Box", "name": "Lamp", "scene": "res://lamp.tscn"})],
        );
        assert!(report.is_clean());

        let lamp = tree.resolve("/root/Box/Lamp").unwrap();
        assert!(tree.is_owned(lamp));
        assert_eq!(tree.property_at("/root/Box/Lamp", "energy"), Some(PropertyValue::Float(1.0)));
    }

    #[test]
    fn test_add_node_failures() {
        let mut tree = scene();
        let before = tree.len();
        let report = apply(
            &mut tree,
            vec![
                json!({"type": "add_node", "parent": "/root/Nope", "name": "Lamp", "scene": "res://lamp.tscn"}),
                json!({"type": "add_node", "parent": "/root", "name": "Lamp", "scene": "res://missing.tscn"}),
                json!({"type": "add_node", "parent": "/root", "name": "Box", "scene": "res://lamp.tscn"}),
            ],
        );
        assert_eq!(report.applied, 0);
        assert!(matches!(report.skipped[0].error, ApplyError::ParentNotFound(_)));
        assert!(matches!(report.skipped[1].error, ApplyError::ResourceLoadFailed { .. }));
        assert!(matches!(report.skipped[2].error, ApplyError::AttachFailed { .. }));

        // The instance created for the failed attach is queued for destruction.
        assert_eq!(tree.flush_destroyed(), 1);
        assert_eq!(tree.len(), before);
    }

    #[test]
    fn test_remove_node_defers_destruction() {
        let mut tree = scene();
        let report = apply(
            &mut tree,
            vec![
                json!({"type": "remove_node", "node": "/root/Box"}),
                json!({"type": "set_property", "node": "/root/Box", "property": "visible", "value": false}),
            ],
        );
        assert_eq!(report.applied, 1);
        assert!(matches!(report.skipped[0].error, ApplyError::NodeNotFound(_)));
        assert_eq!(tree.pending_destroy(), 1);
    }

    #[test]
    fn test_report_carries_batch_id() {
        let mut tree = scene();
        let report = apply(&mut tree, Vec::new());
        assert_eq!(report.batch_id, 7);
        assert_eq!(report.attempted(), 0);
    }
}
