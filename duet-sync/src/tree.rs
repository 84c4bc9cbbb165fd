//! Document tree capability consumed by the application engine.
//!
//! The sync core never owns a node model. Hosts implement [`TreeAccessor`]
//! over their own tree; [`MemoryTree`] is a self-contained implementation
//! used by tests, benchmarks and headless peers.

use std::collections::{BTreeMap, HashMap};
use std::mem::discriminant;

use crate::value::PropertyValue;

/// Errors reported by a tree accessor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Property '{property}' rejected: {reason}")]
    PropertyRejected { property: String, reason: String },
    #[error("Failed to load resource '{reference}': {reason}")]
    ResourceLoad { reference: String, reason: String },
    #[error("Failed to attach '{name}': {reason}")]
    Attach { name: String, reason: String },
    #[error("Failed to destroy node: {0}")]
    Destroy(String),
}

/// Narrow interface onto the host's document tree.
///
/// Paths are slash-separated and rooted at the edited document's root.
pub trait TreeAccessor {
    type Node: Clone + std::fmt::Debug;
    type Resource;

    fn resolve(&self, path: &str) -> Option<Self::Node>;

    fn get_property(&self, node: &Self::Node, name: &str) -> Option<PropertyValue>;

    fn set_property(
        &mut self,
        node: &Self::Node,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), TreeError>;

    fn load_resource(&mut self, reference: &str) -> Result<Self::Resource, TreeError>;

    /// Create a detached node from a loaded resource.
    fn instantiate(&mut self, resource: &Self::Resource) -> Self::Node;

    fn attach(&mut self, parent: &Self::Node, child: &Self::Node, name: &str)
        -> Result<(), TreeError>;

    /// Mark a node as owned by the document root so it is saved with the document.
    fn mark_owned(&mut self, _node: &Self::Node) -> Result<(), TreeError> {
        Ok(())
    }

    /// Queue a node for destruction. Once queued it must no longer resolve.
    fn schedule_destroy(&mut self, node: &Self::Node) -> Result<(), TreeError>;
}

/// Handle to a node in a [`MemoryTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Template instantiated by `add_node` changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTemplate {
    pub properties: BTreeMap<String, PropertyValue>,
}

impl ResourceTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
struct NodeData {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    properties: BTreeMap<String, PropertyValue>,
    owned: bool,
    scheduled: bool,
}

impl NodeData {
    fn detached(properties: BTreeMap<String, PropertyValue>) -> Self {
        Self {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            properties,
            owned: false,
            scheduled: false,
        }
    }
}

/// In-memory document tree with typed properties.
///
/// Property writes are checked against the existing value's kind: unknown
/// properties and kind changes are rejected, integers widen into float
/// properties, and a `Nil` property accepts anything.
#[derive(Debug, Clone)]
pub struct MemoryTree {
    nodes: HashMap<NodeId, NodeData>,
    root: NodeId,
    next_id: usize,
    resources: HashMap<String, ResourceTemplate>,
    destroy_queue: Vec<NodeId>,
}

impl MemoryTree {
    pub fn new(root_name: &str) -> Self {
        let root = NodeId(0);
        let mut data = NodeData::detached(BTreeMap::new());
        data.name = root_name.to_string();
        data.owned = true;

        let mut nodes = HashMap::new();
        nodes.insert(root, data);
        Self {
            nodes,
            root,
            next_id: 1,
            resources: HashMap::new(),
            destroy_queue: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Insert an owned node under `parent_path`, returning its handle.
    pub fn insert_node<I, K>(
        &mut self,
        parent_path: &str,
        name: &str,
        properties: I,
    ) -> Result<NodeId, TreeError>
    where
        I: IntoIterator<Item = (K, PropertyValue)>,
        K: Into<String>,
    {
        let parent = self
            .resolve(parent_path)
            .ok_or_else(|| TreeError::NodeNotFound(parent_path.to_string()))?;
        let props = properties.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let id = self.allocate(NodeData::detached(props));
        self.attach(&parent, &id, name)?;
        self.mark_owned(&id)?;
        Ok(id)
    }

    pub fn register_resource(&mut self, reference: &str, template: ResourceTemplate) {
        self.resources.insert(reference.to_string(), template);
    }

    /// Absolute path of an attached node.
    pub fn path_of(&self, node: NodeId) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let data = self.live(id)?;
            segments.push(data.name.as_str());
            if id == self.root {
                segments.reverse();
                return Some(format!("/{}", segments.join("/")));
            }
            current = data.parent;
        }
        None
    }

    pub fn is_owned(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|n| n.owned)
    }

    /// Names of the attached children of `node`, in insertion order.
    pub fn child_names(&self, node: NodeId) -> Vec<String> {
        self.live(node)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| self.nodes.get(c))
                    .map(|c| c.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Property by path, for assertions and host reads.
    pub fn property_at(&self, path: &str, name: &str) -> Option<PropertyValue> {
        let node = self.resolve(path)?;
        self.get_property(&node, name)
    }

    /// Number of nodes awaiting [`flush_destroyed`](Self::flush_destroyed).
    pub fn pending_destroy(&self) -> usize {
        self.destroy_queue.len()
    }

    /// Free every queued node together with its subtree.
    pub fn flush_destroyed(&mut self) -> usize {
        let mut freed = 0;
        let mut stack: Vec<NodeId> = std::mem::take(&mut self.destroy_queue);
        while let Some(id) = stack.pop() {
            if let Some(data) = self.nodes.remove(&id) {
                stack.extend(data.children);
                freed += 1;
            }
        }
        freed
    }

    /// Total number of nodes held, including detached and queued ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn allocate(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, data);
        id
    }

    fn live(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(&id).filter(|n| !n.scheduled)
    }

    fn child_named(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.live(parent)?
            .children
            .iter()
            .copied()
            .find(|c| self.live(*c).is_some_and(|n| n.name == name))
    }
}

impl TreeAccessor for MemoryTree {
    type Node = NodeId;
    type Resource = ResourceTemplate;

    fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = segments.next()?;
        if self.live(self.root)?.name != first {
            return None;
        }
        segments.try_fold(self.root, |node, name| self.child_named(node, name))
    }

    fn get_property(&self, node: &NodeId, name: &str) -> Option<PropertyValue> {
        self.live(*node)?.properties.get(name).cloned()
    }

    fn set_property(
        &mut self,
        node: &NodeId,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), TreeError> {
        let data = self
            .nodes
            .get_mut(node)
            .filter(|n| !n.scheduled)
            .ok_or_else(|| TreeError::NodeNotFound(format!("{node:?}")))?;

        let slot = data
            .properties
            .get_mut(name)
            .ok_or_else(|| TreeError::PropertyRejected {
                property: name.to_string(),
                reason: "no such property".to_string(),
            })?;

        *slot = match (&*slot, value) {
            (PropertyValue::Float(_), PropertyValue::Int(i)) => PropertyValue::Float(i as f64),
            (PropertyValue::Nil, v) => v,
            (current, v) if discriminant(current) == discriminant(&v) => v,
            (current, v) => {
                return Err(TreeError::PropertyRejected {
                    property: name.to_string(),
                    reason: format!("expected {}, got {}", current.kind_name(), v.kind_name()),
                })
            }
        };
        Ok(())
    }

    fn load_resource(&mut self, reference: &str) -> Result<ResourceTemplate, TreeError> {
        self.resources
            .get(reference)
            .cloned()
            .ok_or_else(|| TreeError::ResourceLoad {
                reference: reference.to_string(),
                reason: "not registered".to_string(),
            })
    }

    fn instantiate(&mut self, resource: &ResourceTemplate) -> NodeId {
        self.allocate(NodeData::detached(resource.properties.clone()))
    }

    fn attach(&mut self, parent: &NodeId, child: &NodeId, name: &str) -> Result<(), TreeError> {
        let fail = |reason: &str| TreeError::Attach {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() || name.contains('/') {
            return Err(fail("invalid node name"));
        }
        if self.live(*parent).is_none() {
            return Err(fail("parent is not in the tree"));
        }
        match self.nodes.get(child) {
            None => return Err(fail("unknown node")),
            Some(c) if c.scheduled => return Err(fail("node is queued for destruction")),
            Some(c) if c.parent.is_some() || *child == self.root => {
                return Err(fail("node is already attached"))
            }
            Some(_) => {}
        }
        if self.child_named(*parent, name).is_some() {
            return Err(fail("a sibling with this name exists"));
        }

        if let Some(c) = self.nodes.get_mut(child) {
            c.name = name.to_string();
            c.parent = Some(*parent);
        }
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(*child);
        }
        Ok(())
    }

    fn mark_owned(&mut self, node: &NodeId) -> Result<(), TreeError> {
        let data = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| TreeError::NodeNotFound(format!("{node:?}")))?;
        data.owned = true;
        Ok(())
    }

    fn schedule_destroy(&mut self, node: &NodeId) -> Result<(), TreeError> {
        if *node == self.root {
            return Err(TreeError::Destroy("cannot destroy the document root".to_string()));
        }
        let parent = match self.nodes.get_mut(node) {
            Some(data) if !data.scheduled => {
                data.scheduled = true;
                data.parent.take()
            }
            _ => return Err(TreeError::Destroy(format!("{node:?} is not live"))),
        };
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.retain(|c| c != node);
        }
        self.destroy_queue.push(*node);
        Ok(())
    }
}
