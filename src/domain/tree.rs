//! An arena of criteria nodes keyed by identifier.
//!
//! The [`Tree`] knows nothing about temporal constraints, id counters or
//! population counts. It owns the nodes and the parent links between them,
//! and resolves them for traversal and rendering.
//!
//! Nodes are reference counted so that cloning a tree shares every node
//! with the original; a node is copied only when it is written to.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use petgraph::{algo::tarjan_scc, graphmap::DiGraphMap, Direction};
use serde::Serialize;
use thiserror::Error;

use crate::domain::{Group, GroupType, IdAllocator, Leaf, NodeId};

/// A node of the criteria tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// An internal boolean node.
    Group(Group),
    /// A selected criterion.
    Leaf(Leaf),
}

impl Node {
    /// The node's identifier.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        match self {
            Self::Group(group) => group.id,
            Self::Leaf(leaf) => leaf.id,
        }
    }

    /// A borrowed view of the node.
    #[must_use]
    pub const fn view(&self) -> NodeRef<'_> {
        match self {
            Self::Group(group) => NodeRef::Group(group),
            Self::Leaf(leaf) => NodeRef::Leaf(leaf),
        }
    }
}

/// A borrowed node, as handed to renderers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeRef<'a> {
    /// An internal boolean node.
    Group(&'a Group),
    /// A selected criterion.
    Leaf(&'a Leaf),
}

impl NodeRef<'_> {
    /// The node's identifier.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        match self {
            Self::Group(group) => group.id,
            Self::Leaf(leaf) => leaf.id,
        }
    }

    /// The node's display title.
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Group(group) => &group.title,
            Self::Leaf(leaf) => &leaf.title,
        }
    }

    /// The node's inclusion flag.
    #[must_use]
    pub const fn is_inclusive(&self) -> bool {
        match self {
            Self::Group(group) => group.is_inclusive,
            Self::Leaf(leaf) => leaf.is_inclusive,
        }
    }
}

/// The criteria tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    /// Every live node, keyed by id.
    nodes: BTreeMap<NodeId, Arc<Node>>,

    /// Parent of every non-root node.
    ///
    /// Derived from the groups' child lists and kept in step with them.
    parents: BTreeMap<NodeId, NodeId>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new(GroupType::And)
    }
}

/// A violation of the tree's structural invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// There is no root group.
    #[error("the root group is missing")]
    MissingRoot,
    /// The root group is flagged as a sub-group.
    #[error("the root group is flagged as a sub-group")]
    RootIsSubGroup,
    /// A group lists a child that does not exist.
    #[error("group {parent} lists missing child {child}")]
    DanglingChild {
        /// The group holding the reference.
        parent: NodeId,
        /// The missing child.
        child: NodeId,
    },
    /// A node is listed by more than one group, or twice by the same group.
    #[error("node {0} has more than one parent")]
    SharedNode(NodeId),
    /// A set of groups contain each other.
    #[error("groups {0:?} form a cycle")]
    Cycle(Vec<NodeId>),
    /// A node cannot be reached from the root.
    #[error("node {0} is not reachable from the root")]
    Unreachable(NodeId),
    /// A group holds a positive id or a leaf a non-positive one.
    #[error("node {0} has an id outside the range of its kind")]
    WrongIdRange(NodeId),
    /// A node's id has not been issued by the allocator yet.
    #[error("node {0} has an id the allocator has not issued yet")]
    UnissuedId(NodeId),
    /// A group's sub-group flag disagrees with its position.
    #[error("group {0} has an inconsistent sub-group flag")]
    SubGroupFlag(NodeId),
    /// A temporal constraint names a node that does not exist.
    #[error("a temporal constraint names missing node {0}")]
    DanglingConstraint(NodeId),
}

impl Tree {
    /// A tree holding only a root group of the given type.
    #[must_use]
    pub fn new(root_type: GroupType) -> Self {
        let root = Node::Group(Group::root(root_type));
        Self {
            nodes: BTreeMap::from([(NodeId::ROOT, Arc::new(root))]),
            parents: BTreeMap::new(),
        }
    }

    /// Builds a tree from persisted groups and leaves.
    ///
    /// # Errors
    ///
    /// Returns every structural violation found; see
    /// [`Tree::check_integrity`].
    pub fn from_parts(
        groups: impl IntoIterator<Item = Group>,
        leaves: impl IntoIterator<Item = Leaf>,
        ids: &IdAllocator,
    ) -> Result<Self, Vec<IntegrityError>> {
        let mut nodes = BTreeMap::new();
        let mut shared = Vec::new();
        for node in groups
            .into_iter()
            .map(Node::Group)
            .chain(leaves.into_iter().map(Node::Leaf))
        {
            let id = node.id();
            if nodes.insert(id, Arc::new(node)).is_some() {
                shared.push(IntegrityError::SharedNode(id));
            }
        }

        let mut tree = Self {
            nodes,
            parents: BTreeMap::new(),
        };
        tree.rebuild_parent_index();

        let mut errors = tree.check_integrity(ids);
        errors.extend(shared);
        if errors.is_empty() {
            Ok(tree)
        } else {
            Err(errors)
        }
    }

    fn rebuild_parent_index(&mut self) {
        self.parents = self
            .groups()
            .flat_map(|group| group.criteria_ids.iter().map(|&child| (child, group.id)))
            .collect();
    }

    /// The number of live nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always `false`: the root group can never be removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a node with this id exists.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<NodeRef<'_>> {
        self.nodes.get(&id).map(|node| node.view())
    }

    /// Looks up a group.
    #[must_use]
    pub fn group(&self, id: NodeId) -> Option<&Group> {
        match self.get(id)? {
            NodeRef::Group(group) => Some(group),
            NodeRef::Leaf(_) => None,
        }
    }

    /// Looks up a leaf.
    #[must_use]
    pub fn leaf(&self, id: NodeId) -> Option<&Leaf> {
        match self.get(id)? {
            NodeRef::Leaf(leaf) => Some(leaf),
            NodeRef::Group(_) => None,
        }
    }

    /// The root group.
    ///
    /// # Panics
    ///
    /// Panics if the root group is missing, which the store never allows.
    #[must_use]
    pub fn root(&self) -> &Group {
        self.group(NodeId::ROOT)
            .expect("the root group always exists")
    }

    /// The parent group of a node, if it has one.
    #[must_use]
    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.parents.get(&id).copied()
    }

    /// Iterates over every group, in id order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> + '_ {
        self.nodes.values().filter_map(|node| match node.as_ref() {
            Node::Group(group) => Some(group),
            Node::Leaf(_) => None,
        })
    }

    /// Iterates over every leaf, in id order.
    pub fn leaves(&self) -> impl Iterator<Item = &Leaf> + '_ {
        self.nodes.values().filter_map(|node| match node.as_ref() {
            Node::Leaf(leaf) => Some(leaf),
            Node::Group(_) => None,
        })
    }

    /// The resolved children of a group, in order.
    ///
    /// Ids that resolve to no node are skipped. Returns an empty list if
    /// `group_id` is not a group.
    #[must_use]
    pub fn children_of(&self, group_id: NodeId) -> Vec<NodeRef<'_>> {
        self.group(group_id)
            .map(|group| {
                group
                    .criteria_ids
                    .iter()
                    .filter_map(|&id| self.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A depth-first walk of the subtree rooted at `root_id`.
    ///
    /// The walk borrows the tree and can be restarted by calling this again.
    #[must_use]
    pub fn subtree(&self, root_id: NodeId) -> Subtree<'_> {
        let stack = self
            .get(root_id)
            .map(|node| vec![SubtreeEntry { depth: 0, node }])
            .unwrap_or_default();
        Subtree { tree: self, stack }
    }

    /// The ids of every node strictly below `id`.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        self.subtree(id).skip(1).map(|entry| entry.node.id()).collect()
    }

    /// An owned, recursive copy of the subtree rooted at `root_id`.
    #[must_use]
    pub fn compose(&self, root_id: NodeId) -> Option<ComposedNode> {
        Some(match self.get(root_id)? {
            NodeRef::Leaf(leaf) => ComposedNode::Leaf(leaf.clone()),
            NodeRef::Group(group) => ComposedNode::Group {
                id: group.id,
                title: group.title.clone(),
                group_type: group.group_type,
                is_inclusive: group.is_inclusive,
                children: group
                    .criteria_ids
                    .iter()
                    .filter_map(|&child| self.compose(child))
                    .collect(),
            },
        })
    }

    /// Lists every violation of the structural invariants.
    ///
    /// An empty list means the nodes form a single tree under the root, each
    /// id lies in the range of its kind and has already been issued by
    /// `ids`.
    #[must_use]
    pub fn check_integrity(&self, ids: &IdAllocator) -> Vec<IntegrityError> {
        let mut errors = Vec::new();

        match self.group(NodeId::ROOT) {
            None => errors.push(IntegrityError::MissingRoot),
            Some(root) if root.is_sub_group => errors.push(IntegrityError::RootIsSubGroup),
            Some(_) => {}
        }

        let mut graph: DiGraphMap<NodeId, ()> = DiGraphMap::with_capacity(self.len(), self.len());
        for &id in self.nodes.keys() {
            graph.add_node(id);
        }

        for group in self.groups() {
            for &child in &group.criteria_ids {
                if !self.contains(child) {
                    errors.push(IntegrityError::DanglingChild {
                        parent: group.id,
                        child,
                    });
                } else if graph.add_edge(group.id, child, ()).is_some() {
                    errors.push(IntegrityError::SharedNode(child));
                }
            }
        }

        for id in graph.nodes() {
            if graph.neighbors_directed(id, Direction::Incoming).count() > 1 {
                errors.push(IntegrityError::SharedNode(id));
            }
        }

        for component in tarjan_scc(&graph) {
            let is_cycle = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&node| graph.contains_edge(node, node));
            if is_cycle {
                let mut component = component;
                component.sort();
                errors.push(IntegrityError::Cycle(component));
            }
        }

        let reachable: HashSet<NodeId> = self
            .subtree_ids_bounded(NodeId::ROOT, self.len())
            .into_iter()
            .collect();

        for node in self.nodes.values() {
            let id = node.id();
            let in_range = match node.as_ref() {
                Node::Group(_) => id.in_group_range(),
                Node::Leaf(_) => id.in_leaf_range(),
            };
            if !in_range {
                errors.push(IntegrityError::WrongIdRange(id));
            }
            if !ids.has_issued(id) {
                errors.push(IntegrityError::UnissuedId(id));
            }
            if !reachable.contains(&id) {
                errors.push(IntegrityError::Unreachable(id));
            }
            if let Node::Group(group) = node.as_ref() {
                let below_root = self.parent_of(id).is_some_and(|parent| !parent.is_root());
                if !id.is_root() && group.is_sub_group != below_root {
                    errors.push(IntegrityError::SubGroupFlag(id));
                }
            }
        }

        errors
    }

    /// Collects ids below `root` without trusting the structure to be
    /// acyclic: a node is visited at most once and at most `limit` nodes are
    /// returned.
    fn subtree_ids_bounded(&self, root: NodeId, limit: usize) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        let mut out = Vec::new();
        while let Some(id) = stack.pop() {
            if out.len() >= limit || !seen.insert(id) || !self.contains(id) {
                continue;
            }
            out.push(id);
            if let Some(group) = self.group(id) {
                stack.extend(group.criteria_ids.iter().rev().copied());
            }
        }
        out
    }
}

/// Mutation primitives used by the store. They keep the parent index in
/// step with the child lists but enforce no other rule.
impl Tree {
    pub(crate) fn group_mut(&mut self, id: NodeId) -> Option<&mut Group> {
        match Arc::make_mut(self.nodes.get_mut(&id)?) {
            Node::Group(group) => Some(group),
            Node::Leaf(_) => None,
        }
    }

    /// Inserts `node` as the last child of `parent`.
    ///
    /// The caller guarantees that `parent` is a group and that the node's id
    /// is fresh.
    pub(crate) fn attach(&mut self, parent: NodeId, node: Node) {
        let id = node.id();
        debug_assert!(!self.contains(id), "node {id} already exists");
        if let Some(group) = self.group_mut(parent) {
            group.criteria_ids.push(id);
            group.refit_threshold();
        }
        self.parents.insert(id, parent);
        self.nodes.insert(id, Arc::new(node));
    }

    /// Replaces a node in place, keeping its position and links.
    pub(crate) fn replace(&mut self, node: Node) {
        self.nodes.insert(node.id(), Arc::new(node));
    }

    /// Removes a node and everything below it, unlinking it from its parent.
    ///
    /// Returns the ids of every removed node, the node itself first.
    pub(crate) fn remove_subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut removed = vec![id];
        removed.extend(self.descendants(id));

        if let Some(parent) = self.parents.remove(&id) {
            if let Some(group) = self.group_mut(parent) {
                group.criteria_ids.retain(|&child| child != id);
                group.refit_threshold();
            }
        }

        for node in &removed {
            self.nodes.remove(node);
            self.parents.remove(node);
        }

        removed
    }
}

/// One step of a depth-first walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtreeEntry<'a> {
    /// Distance from the walk's starting node.
    pub depth: usize,
    /// The visited node.
    pub node: NodeRef<'a>,
}

/// Depth-first, pre-order walk over a subtree. See [`Tree::subtree`].
#[derive(Debug, Clone)]
pub struct Subtree<'a> {
    tree: &'a Tree,
    stack: Vec<SubtreeEntry<'a>>,
}

impl<'a> Iterator for Subtree<'a> {
    type Item = SubtreeEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.stack.pop()?;
        if let NodeRef::Group(group) = entry.node {
            let depth = entry.depth + 1;
            self.stack.extend(
                group
                    .criteria_ids
                    .iter()
                    .rev()
                    .filter_map(|&id| self.tree.get(id))
                    .map(|node| SubtreeEntry { depth, node }),
            );
        }
        Some(entry)
    }
}

/// An owned, recursive view of a subtree, as handed to the query builder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComposedNode {
    /// A group and its resolved children.
    Group {
        /// The group's id.
        id: NodeId,
        /// Display title.
        title: String,
        /// Stored type and options.
        #[serde(flatten)]
        group_type: GroupType,
        /// Inclusion flag.
        #[serde(rename = "isInclusive")]
        is_inclusive: bool,
        /// Resolved children, in order.
        children: Vec<ComposedNode>,
    },
    /// A selected criterion.
    Leaf(Leaf),
}

impl ComposedNode {
    /// The node's id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        match self {
            Self::Group { id, .. } => *id,
            Self::Leaf(leaf) => leaf.id,
        }
    }
}
