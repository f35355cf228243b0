//! Dependency graph over the dirty entities of a session.
//!
//! An edge `parent → child` means the parent must be persisted before the
//! child can be sent: the child has a dirty belongs-to reference to the
//! parent. Root nodes are dirty nodes without any dirty ancestor; every
//! other dirty node is reached from a root during orchestration.
//!
//! Root selection runs Kahn's algorithm over the whole graph, so a cycle
//! is reported as [`FlushError::DependencyCycle`] instead of recursing
//! without end.

use crate::error::{FlushError, FlushResult};
use relsync_model::{ChangeKind, ClientId, Entity, EntityKey, RelationshipKind, Session};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, trace};

/// Index of a node in its graph.
pub type NodeId = usize;

/// Remote operation implied by a node's classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Nothing to send; the node only exists as a structural parent.
    None,
    /// Create the entity.
    Create,
    /// Update the entity.
    Update,
    /// Delete the entity.
    Delete,
}

impl Operation {
    /// Returns a short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::None => "none",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// One entity's place in the dependency graph of a single flush.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    key: EntityKey,
    dirty: bool,
    operation: Operation,
    children: BTreeSet<NodeId>,
    parents: BTreeSet<NodeId>,
}

impl DependencyNode {
    fn new(key: EntityKey) -> Self {
        Self {
            key,
            dirty: false,
            operation: Operation::None,
            children: BTreeSet::new(),
            parents: BTreeSet::new(),
        }
    }

    /// Returns the entity key.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Returns the entity's local identity.
    pub fn client_id(&self) -> ClientId {
        self.key.client_id
    }

    /// Returns true if the entity must be sent.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the remote operation for this node.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Returns the nodes that depend on this one.
    pub fn children(&self) -> &BTreeSet<NodeId> {
        &self.children
    }

    /// Returns the nodes this one depends on.
    pub fn parents(&self) -> &BTreeSet<NodeId> {
        &self.parents
    }
}

/// The dependency graph of one flush.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    index: HashMap<ClientId, NodeId>,
    roots: Vec<NodeId>,
}

impl DependencyGraph {
    /// Builds the graph for the session's current working set.
    pub fn build(session: &Session) -> FlushResult<Self> {
        let mut graph = Self::default();
        let schema = session.schema();
        let identity_map = session.identity_map();

        for entity in session.entities() {
            if !entity.is_loaded() {
                trace!(entity = %entity.key(), "skipping unloaded entity");
                continue;
            }

            let node = graph.node_for(entity.key().clone());
            let (operation, edges) = classify(&entity, identity_map.snapshot(entity.client_id()));
            graph.nodes[node].operation = operation;
            graph.nodes[node].dirty = operation != Operation::None;

            for name in edges {
                let Some(target) = entity.belongs_to(&name) else {
                    continue;
                };
                let relationship = schema.relationship(entity.entity_type(), &name)?;
                let parent = graph.node_for(EntityKey::new(relationship.target.clone(), target));
                graph.add_edge(parent, node);
            }
        }

        graph.select_roots()?;
        debug!(
            nodes = graph.nodes.len(),
            roots = graph.roots.len(),
            "built dependency graph"
        );
        Ok(graph)
    }

    fn node_for(&mut self, key: EntityKey) -> NodeId {
        if let Some(&id) = self.index.get(&key.client_id) {
            return id;
        }
        let id = self.nodes.len();
        self.index.insert(key.client_id, id);
        self.nodes.push(DependencyNode::new(key));
        id
    }

    fn add_edge(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.insert(child);
        self.nodes[child].parents.insert(parent);
    }

    /// Selects dirty nodes without dirty ancestors, visiting nodes in
    /// topological order. Nodes never reached are part of, or downstream
    /// of, a cycle.
    fn select_roots(&mut self) -> FlushResult<()> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.parents.len()).collect();
        let mut blocked = vec![false; self.nodes.len()];
        let mut queue: VecDeque<NodeId> = (0..self.nodes.len())
            .filter(|&id| in_degree[id] == 0)
            .collect();
        let mut visited = 0;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            let node = &self.nodes[id];
            let blocks_children = node.dirty || blocked[id];
            for &child in &node.children {
                if blocks_children {
                    blocked[child] = true;
                }
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if visited < self.nodes.len() {
            let members = (0..self.nodes.len())
                .filter(|&id| in_degree[id] > 0)
                .map(|id| self.nodes[id].key.clone())
                .collect();
            return Err(FlushError::DependencyCycle { members });
        }

        self.roots = (0..self.nodes.len())
            .filter(|&id| self.nodes[id].dirty && !blocked[id])
            .collect();
        Ok(())
    }

    /// Returns the root nodes.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Returns a node.
    ///
    /// # Panics
    ///
    /// Panics if the id does not belong to this graph.
    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id]
    }

    /// Returns the node wrapping an entity, if any.
    pub fn node_for_entity(&self, client_id: ClientId) -> Option<&DependencyNode> {
        self.index.get(&client_id).map(|&id| &self.nodes[id])
    }

    /// Iterates over all nodes with their ids.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.nodes.iter().enumerate()
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of dirty nodes.
    pub fn dirty_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.dirty).count()
    }

    /// Returns the local identities of the root entities.
    pub fn root_entities(&self) -> Vec<ClientId> {
        self.roots.iter().map(|&id| self.nodes[id].client_id()).collect()
    }
}

/// Classifies an entity and lists the belongs-to relationships that are
/// dependency edge candidates.
fn classify(entity: &Entity, cached: Option<Entity>) -> (Operation, Vec<String>) {
    if entity.is_new() {
        if entity.is_deleted() {
            return (Operation::None, Vec::new());
        }
        let edges = entity
            .relationships()
            .filter(|(_, r)| r.kind() == RelationshipKind::BelongsTo)
            .map(|(name, _)| name.to_string())
            .collect();
        return (Operation::Create, edges);
    }

    if entity.is_deleted() {
        return (Operation::Delete, Vec::new());
    }

    let changes = match cached {
        Some(cached) => entity.diff(&cached),
        None => entity.diff_from_empty(),
    };

    let mut attributes_changed = false;
    let mut edges = Vec::new();
    for change in changes {
        match change.kind {
            ChangeKind::Attribute => attributes_changed = true,
            ChangeKind::BelongsTo => edges.push(change.name),
            ChangeKind::HasMany => {}
        }
    }

    if attributes_changed || !edges.is_empty() {
        (Operation::Update, edges)
    } else {
        (Operation::None, Vec::new())
    }
}
