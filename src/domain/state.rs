//! The authoritative cohort state and the reducers that change it.
//!
//! Every operation takes the current snapshot by reference and returns a new
//! one. A rejected operation returns an error and the caller keeps the
//! snapshot it already has, so a failed call never leaves a half-applied
//! change behind. Older snapshots stay valid and share unchanged nodes with
//! newer ones.

use std::{
    collections::HashSet,
    sync::{Arc, OnceLock},
};

use borsh::BorshSerialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

use crate::domain::{
    config::SubgroupDefault,
    constraint::{count_invalidated, TemporalConstraint},
    counts::StageCounts,
    group::{resolve_transition, GroupDraft, GroupKind, GroupPatch, NAmongMOptions},
    tree::{ComposedNode, Node, NodeRef},
    Config, Group, GroupType, IdAllocator, Leaf, LeafDraft, NodeId, Tree,
};

/// Errors returned by rejected operations.
///
/// None of these are fatal: the previous snapshot is still valid and should
/// simply be kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The referenced node does not exist.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    /// The referenced node exists but is a leaf.
    #[error("node {0} is not a group")]
    NotAGroup(NodeId),
    /// The referenced node exists but is a group.
    #[error("node {0} is not a criterion")]
    NotALeaf(NodeId),
    /// The root group cannot be deleted.
    #[error("the root group cannot be deleted")]
    RootIsUndeletable,
    /// The referenced temporal constraint does not exist.
    #[error("temporal constraint #{0} not found")]
    ConstraintNotFound(usize),
    /// The group is not an N-among-M group, so it has no numeric options.
    #[error("group {0} has no numeric options")]
    NoOptions(NodeId),
    /// Changing the group's type would drop temporal constraints, and the
    /// edit policy asks for that to be confirmed through
    /// [`CohortState::retype_group`].
    #[error("changing the type of group {id} would drop {purged} temporal constraint(s)")]
    PurgeNeedsConfirmation {
        /// The group being edited.
        id: NodeId,
        /// How many constraints the change would drop.
        purged: usize,
    },
}

/// Behaviour that depends on user configuration rather than on the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditPolicy {
    /// Type given to new sub-groups when the draft does not name one.
    pub subgroup_default: SubgroupDefault,
    /// Whether dropping temporal constraints needs explicit confirmation.
    pub confirm_constraint_purge: bool,
}

impl Default for EditPolicy {
    fn default() -> Self {
        Self {
            subgroup_default: SubgroupDefault::Opposite,
            confirm_constraint_purge: true,
        }
    }
}

impl From<&Config> for EditPolicy {
    fn from(config: &Config) -> Self {
        Self {
            subgroup_default: config.subgroup_default,
            confirm_constraint_purge: config.confirm_constraint_purge,
        }
    }
}

/// Outcome of a request to change a group's type.
#[derive(Debug, Clone)]
pub enum Retype {
    /// The change was applied.
    Applied(CohortState),
    /// The change would drop temporal constraints and was not confirmed.
    NeedsConfirmation {
        /// How many constraints would be dropped.
        purged: usize,
    },
}

/// The whole editable cohort: the criteria tree, its temporal constraints and
/// the id counters, plus derived data that is discarded on every change.
#[derive(Debug, Clone)]
pub struct CohortState {
    tree: Tree,
    constraints: Arc<[TemporalConstraint]>,
    ids: IdAllocator,
    policy: EditPolicy,

    /// Bumped by every committed change.
    revision: u64,

    /// Population counts for the current revision, if any have arrived.
    counts: Option<Arc<StageCounts>>,

    /// Composed view of the whole tree for renderers and the query builder.
    display: OnceLock<Arc<ComposedNode>>,
}

impl Default for CohortState {
    fn default() -> Self {
        Self::new(Tree::default(), Vec::new(), IdAllocator::default())
    }
}

impl CohortState {
    /// Wraps existing parts into a state at revision zero.
    #[must_use]
    pub fn new(tree: Tree, constraints: Vec<TemporalConstraint>, ids: IdAllocator) -> Self {
        Self {
            tree,
            constraints: constraints.into(),
            ids,
            policy: EditPolicy::default(),
            revision: 0,
            counts: None,
            display: OnceLock::new(),
        }
    }

    /// Replaces the edit policy. This is not a change to the cohort itself.
    #[must_use]
    pub fn with_policy(mut self, policy: EditPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restores the revision a loaded state was saved at.
    ///
    /// Counts computed before a save stay attachable after a reload, and
    /// counts for any older revision are still refused.
    #[must_use]
    pub const fn at_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// The criteria tree.
    #[must_use]
    pub const fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The temporal constraints, in insertion order.
    #[must_use]
    pub fn constraints(&self) -> &[TemporalConstraint] {
        &self.constraints
    }

    /// The id counters.
    #[must_use]
    pub const fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// The edit policy in force.
    #[must_use]
    pub const fn policy(&self) -> &EditPolicy {
        &self.policy
    }

    /// The number of changes committed to this cohort.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Population counts for this revision, if they have arrived.
    #[must_use]
    pub fn counts(&self) -> Option<&StageCounts> {
        self.counts.as_deref()
    }

    /// The composed view of the whole tree.
    ///
    /// Computed on first use and shared by every clone of this snapshot
    /// until the next change.
    ///
    /// # Panics
    ///
    /// Panics if the root group is missing, which the store never allows.
    #[must_use]
    pub fn composed(&self) -> Arc<ComposedNode> {
        self.display
            .get_or_init(|| {
                Arc::new(
                    self.tree
                        .compose(NodeId::ROOT)
                        .expect("the root group always exists"),
                )
            })
            .clone()
    }

    /// A SHA256 hash of the cohort's query-relevant content.
    ///
    /// Two states with equal fingerprints produce the same backend query, so
    /// consumers can use it to skip redundant rebuilds. Titles are excluded.
    ///
    /// # Panics
    ///
    /// Panics if borsh serialization fails (which should never happen for this
    /// data structure).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        #[derive(BorshSerialize)]
        enum NodeData<'a> {
            Group {
                group_type: &'a GroupType,
                children: &'a [NodeId],
                is_inclusive: bool,
            },
            Leaf {
                kind: &'a str,
                is_inclusive: bool,
                fields: String,
            },
        }

        #[derive(BorshSerialize)]
        struct FingerprintData<'a> {
            nodes: Vec<(NodeId, NodeData<'a>)>,
            constraints: String,
        }

        let nodes = self
            .tree
            .subtree(NodeId::ROOT)
            .map(|entry| {
                let data = match entry.node {
                    NodeRef::Group(group) => NodeData::Group {
                        group_type: &group.group_type,
                        children: group.criteria_ids(),
                        is_inclusive: group.is_inclusive,
                    },
                    NodeRef::Leaf(leaf) => NodeData::Leaf {
                        kind: leaf.kind.as_str(),
                        is_inclusive: leaf.is_inclusive,
                        fields: serde_json::to_string(&leaf.fields)
                            .expect("JSON values always serialize"),
                    },
                };
                (entry.node.id(), data)
            })
            .collect();

        let data = FingerprintData {
            nodes,
            constraints: serde_json::to_string(&*self.constraints)
                .expect("constraints always serialize"),
        };

        let encoded = borsh::to_vec(&data).expect("this should never fail");
        let hash = Sha256::digest(encoded);
        format!("{hash:x}")
    }

    /// Attaches population counts computed for this revision.
    ///
    /// Counts computed for any other revision describe a different query and
    /// are discarded. Returns `true` if the counts were attached.
    pub fn attach_counts(&mut self, counts: StageCounts) -> bool {
        if counts.revision() != self.revision {
            tracing::debug!(
                "Discarding counts for revision {} (current is {})",
                counts.revision(),
                self.revision
            );
            return false;
        }
        self.counts = Some(Arc::new(counts));
        true
    }

    /// Finishes a change: bumps the revision and drops every piece of derived
    /// data.
    fn commit(mut self) -> Self {
        self.revision += 1;
        self.counts = None;
        self.display = OnceLock::new();
        tracing::debug!(revision = self.revision, "Committed change");
        self
    }

    fn require_group(&self, id: NodeId) -> Result<&Group, TreeError> {
        match self.tree.get(id) {
            Some(NodeRef::Group(group)) => Ok(group),
            Some(NodeRef::Leaf(_)) => Err(TreeError::NotAGroup(id)),
            None => Err(TreeError::NodeNotFound(id)),
        }
    }

    fn require_leaf(&self, id: NodeId) -> Result<&Leaf, TreeError> {
        match self.tree.get(id) {
            Some(NodeRef::Leaf(leaf)) => Ok(leaf),
            Some(NodeRef::Group(_)) => Err(TreeError::NotALeaf(id)),
            None => Err(TreeError::NodeNotFound(id)),
        }
    }

    /// Keeps the constraints accepted by `keep`, logging how many were
    /// dropped.
    fn retain_constraints(&mut self, keep: impl Fn(&TemporalConstraint) -> bool) {
        let before = self.constraints.len();
        let kept: Vec<_> = self.constraints.iter().filter(|c| keep(c)).cloned().collect();
        let purged = before - kept.len();
        if purged > 0 {
            tracing::info!("Purged {purged} temporal constraint(s)");
            self.constraints = kept.into();
        }
    }
}

/// Structural operations.
impl CohortState {
    /// Adds a new group as the last child of `parent`.
    ///
    /// Without an explicit kind, the group gets the type chosen by the edit
    /// policy (by default, the opposite of its parent's).
    ///
    /// # Errors
    ///
    /// Returns an error if `parent` does not exist or is not a group.
    #[instrument(level = "debug", skip(self, draft))]
    pub fn add_group(
        &self,
        parent: NodeId,
        draft: GroupDraft,
    ) -> Result<(Self, NodeId), TreeError> {
        let parent_type = self
            .require_group(parent)
            .inspect_err(|e| tracing::warn!("Cannot add group: {e}"))?
            .group_type;

        let group_type = draft.kind.map_or_else(
            || self.policy.subgroup_default.for_parent(&parent_type),
            resolve_transition,
        );

        let mut next = self.clone();
        let id = next.ids.allocate_group();
        let mut group = Group::root(group_type);
        group.id = id;
        group.title = draft.title;
        group.is_inclusive = draft.is_inclusive;
        group.is_sub_group = !parent.is_root();

        next.tree.attach(parent, Node::Group(group));
        tracing::debug!("Added group {id} under {parent}");
        Ok((next.commit(), id))
    }

    /// Adds a new leaf as the last child of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if `parent` does not exist or is not a group.
    #[instrument(level = "debug", skip(self, draft))]
    pub fn add_leaf(&self, parent: NodeId, draft: LeafDraft) -> Result<(Self, NodeId), TreeError> {
        self.require_group(parent)
            .inspect_err(|e| tracing::warn!("Cannot add criterion: {e}"))?;

        let mut next = self.clone();
        let id = next.ids.allocate_leaf();
        next.tree
            .attach(parent, Node::Leaf(Leaf::from_draft(id, draft)));
        tracing::debug!("Added criterion {id} under {parent}");
        Ok((next.commit(), id))
    }

    /// Replaces a group's title, type and inclusion flag.
    ///
    /// Children and the sub-group flag are kept. N-among-M options are fitted
    /// to the child count. Moving the group away from AND drops the
    /// constraints it invalidates, unless the edit policy asks for that to be
    /// confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if `patch.id` does not exist or is not a group, or
    /// [`TreeError::PurgeNeedsConfirmation`] if the type change would drop
    /// constraints that the policy wants confirmed.
    #[instrument(level = "debug", skip(self, patch), fields(id = %patch.id))]
    pub fn edit_group(&self, patch: GroupPatch) -> Result<Self, TreeError> {
        let current = self
            .require_group(patch.id)
            .inspect_err(|e| tracing::warn!("Cannot edit group: {e}"))?;

        if !patch.group_type.supports_temporal_constraints() && self.policy.confirm_constraint_purge {
            let purged = self.constraints_at_risk(patch.id)?;
            if purged > 0 {
                let error = TreeError::PurgeNeedsConfirmation {
                    id: patch.id,
                    purged,
                };
                tracing::warn!("Cannot edit group: {error}");
                return Err(error);
            }
        }

        let mut group = current.clone();
        group.title = patch.title;
        group.is_inclusive = patch.is_inclusive;
        group.group_type = patch.group_type;
        group.refit_threshold();

        Ok(self.replace_group(group))
    }

    /// Stores a changed group, dropping the constraints it invalidates if it
    /// no longer accepts them.
    fn replace_group(&self, group: Group) -> Self {
        let was_and = self
            .tree
            .group(group.id)
            .is_some_and(|current| current.group_type.supports_temporal_constraints());

        let mut next = self.clone();
        if was_and && !group.group_type.supports_temporal_constraints() {
            next.retain_constraints(|c| c.is_valid_for(&group));
        }
        next.tree.replace(Node::Group(group));
        next.commit()
    }

    /// Replaces a leaf with `patch`, matched by id.
    ///
    /// # Errors
    ///
    /// Returns an error if `patch.id` does not exist or is not a leaf.
    #[instrument(level = "debug", skip(self, patch), fields(id = %patch.id))]
    pub fn edit_leaf(&self, patch: Leaf) -> Result<Self, TreeError> {
        self.require_leaf(patch.id)
            .inspect_err(|e| tracing::warn!("Cannot edit criterion: {e}"))?;

        let mut next = self.clone();
        next.tree.replace(Node::Leaf(patch));
        Ok(next.commit())
    }

    /// Deletes a group together with everything below it.
    ///
    /// Drops every temporal constraint that names a removed node or that the
    /// deleted group invalidates.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is the root, does not exist, or is a leaf.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_group(&self, id: NodeId) -> Result<Self, TreeError> {
        if id.is_root() {
            tracing::warn!("Refusing to delete the root group");
            return Err(TreeError::RootIsUndeletable);
        }
        let group = self
            .require_group(id)
            .inspect_err(|e| tracing::warn!("Cannot delete group: {e}"))?
            .clone();

        let mut next = self.clone();
        let removed: HashSet<NodeId> = next.tree.remove_subtree(id).into_iter().collect();
        next.retain_constraints(|c| c.is_valid_for(&group) && !c.mentions_any(&removed));
        tracing::debug!("Deleted group {id} and {} descendant(s)", removed.len() - 1);
        Ok(next.commit())
    }

    /// Deletes a leaf and every temporal constraint naming it.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist or is a group.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_leaf(&self, id: NodeId) -> Result<Self, TreeError> {
        self.require_leaf(id)
            .inspect_err(|e| tracing::warn!("Cannot delete criterion: {e}"))?;

        let mut next = self.clone();
        next.tree.remove_subtree(id);
        let removed = HashSet::from([id]);
        next.retain_constraints(|c| !c.mentions_any(&removed));
        Ok(next.commit())
    }

    /// Deletes a node of either kind.
    ///
    /// # Errors
    ///
    /// See [`CohortState::delete_group`] and [`CohortState::delete_leaf`].
    pub fn delete(&self, id: NodeId) -> Result<Self, TreeError> {
        match self.tree.get(id) {
            Some(NodeRef::Group(_)) => self.delete_group(id),
            Some(NodeRef::Leaf(_)) => self.delete_leaf(id),
            None if id.is_root() => Err(TreeError::RootIsUndeletable),
            None => {
                tracing::warn!("Cannot delete node {id}: not found");
                Err(TreeError::NodeNotFound(id))
            }
        }
    }

    /// Copies a leaf under a fresh id, appended to the same parent.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist or is a group.
    #[instrument(level = "debug", skip(self))]
    pub fn duplicate_leaf(&self, id: NodeId) -> Result<(Self, NodeId), TreeError> {
        let leaf = self
            .require_leaf(id)
            .inspect_err(|e| tracing::warn!("Cannot duplicate criterion: {e}"))?;
        let parent = self.tree.parent_of(id).ok_or(TreeError::NodeNotFound(id))?;

        let mut next = self.clone();
        let copy_id = next.ids.allocate_leaf();
        let copy = leaf.duplicate_as(copy_id);
        next.tree.attach(parent, Node::Leaf(copy));
        tracing::debug!("Duplicated criterion {id} as {copy_id}");
        Ok((next.commit(), copy_id))
    }
}

/// Group type and option changes.
impl CohortState {
    /// How many temporal constraints a transition of `id` away from AND would
    /// drop. Zero for groups that are not AND.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist or is not a group.
    pub fn constraints_at_risk(&self, id: NodeId) -> Result<usize, TreeError> {
        let group = self.require_group(id)?;
        Ok(if group.group_type.supports_temporal_constraints() {
            count_invalidated(&self.constraints, group)
        } else {
            0
        })
    }

    /// Changes a group's operator kind.
    ///
    /// Leaving AND drops the constraints the group invalidates. If any would
    /// be dropped, the edit policy demands confirmation and `confirmed` is
    /// `false`, nothing is changed and [`Retype::NeedsConfirmation`] is
    /// returned. Requesting the kind the group already has changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist or is not a group.
    #[instrument(level = "debug", skip(self))]
    pub fn retype_group(
        &self,
        id: NodeId,
        kind: GroupKind,
        confirmed: bool,
    ) -> Result<Retype, TreeError> {
        let group = self
            .require_group(id)
            .inspect_err(|e| tracing::warn!("Cannot change group type: {e}"))?;

        if group.group_type.kind() == kind {
            return Ok(Retype::Applied(self.clone()));
        }

        let purged = if kind == GroupKind::And {
            0
        } else {
            self.constraints_at_risk(id)?
        };
        if purged > 0 && self.policy.confirm_constraint_purge && !confirmed {
            tracing::info!("Changing group {id} to {kind} would drop {purged} constraint(s)");
            return Ok(Retype::NeedsConfirmation { purged });
        }

        let mut group = group.clone();
        group.group_type = resolve_transition(kind);
        Ok(Retype::Applied(self.replace_group(group)))
    }

    /// Replaces the numeric options of an N-among-M group.
    ///
    /// The threshold is clamped to the child count and the delay window is
    /// widened so that its maximum is not below its minimum.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not exist, is not a group, or is not an
    /// N-among-M group.
    #[instrument(level = "debug", skip(self))]
    pub fn set_group_options(&self, id: NodeId, options: NAmongMOptions) -> Result<Self, TreeError> {
        let group = self
            .require_group(id)
            .inspect_err(|e| tracing::warn!("Cannot set group options: {e}"))?;
        if group.group_type.options().is_none() {
            tracing::warn!("Cannot set options on group {id}: it is not an N-among-M group");
            return Err(TreeError::NoOptions(id));
        }

        let mut options = options;
        let child_count = group.criteria_ids().len();
        if usize::try_from(options.number).is_ok_and(|n| n > child_count) {
            tracing::warn!(
                "Threshold {} exceeds the {child_count} children of group {id}; clamping",
                options.number
            );
        }
        options.fit_to(child_count);
        if options.time_delay_max < options.time_delay_min {
            tracing::warn!(
                "Maximum delay {} is below minimum {}; clamping",
                options.time_delay_max,
                options.time_delay_min
            );
            options.time_delay_max = options.time_delay_min;
        }

        let mut group = group.clone();
        group.group_type = GroupType::NAmongM { options };

        let mut next = self.clone();
        next.tree.replace(Node::Group(group));
        Ok(next.commit())
    }
}

/// Temporal constraint management.
impl CohortState {
    /// Appends a temporal constraint.
    ///
    /// # Errors
    ///
    /// Returns an error if the constraint names a node that does not exist.
    pub fn add_constraint(&self, constraint: TemporalConstraint) -> Result<Self, TreeError> {
        if let Some(missing) = constraint.node_ids().find(|&id| !self.tree.contains(id)) {
            tracing::warn!("Cannot add constraint: node {missing} not found");
            return Err(TreeError::NodeNotFound(missing));
        }

        let mut next = self.clone();
        let mut constraints = next.constraints.to_vec();
        constraints.push(constraint);
        next.constraints = constraints.into();
        Ok(next.commit())
    }

    /// Removes the constraint at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no constraint at `index`.
    pub fn remove_constraint(&self, index: usize) -> Result<Self, TreeError> {
        if index >= self.constraints.len() {
            tracing::warn!("Cannot remove constraint #{index}: not found");
            return Err(TreeError::ConstraintNotFound(index));
        }

        let mut next = self.clone();
        let mut constraints = next.constraints.to_vec();
        constraints.remove(index);
        next.constraints = constraints.into();
        Ok(next.commit())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use nonempty::nonempty;
    use non_empty_string::NonEmptyString;
    use serde_json::json;

    use super::*;
    use crate::domain::{
        constraint::{ConstraintTarget, ConstraintType},
        Comparator,
    };

    fn draft(kind: &str) -> LeafDraft {
        LeafDraft::new(NonEmptyString::new(kind.to_string()).unwrap())
    }

    fn id(raw: i64) -> NodeId {
        NodeId::new(raw)
    }

    fn ids(raw: &[i64]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    fn constraint(targets: &[i64]) -> TemporalConstraint {
        let mut targets = targets.iter().map(|&raw| ConstraintTarget::Node(id(raw)));
        let mut list = nonempty![targets.next().unwrap()];
        list.extend(targets);
        TemporalConstraint::new(list, ConstraintType::SameEncounter)
    }

    fn assert_consistent(state: &CohortState) {
        assert_eq!(state.tree().check_integrity(state.ids()), Vec::new());
    }

    /// root(AND) -> [1, -1(OR) -> [2, 3]]
    fn sample() -> CohortState {
        let state = CohortState::default();
        let (state, _) = state.add_leaf(NodeId::ROOT, draft("Condition")).unwrap();
        let (state, group) = state.add_group(NodeId::ROOT, GroupDraft::new()).unwrap();
        let (state, _) = state.add_leaf(group, draft("Medication")).unwrap();
        let (state, _) = state.add_leaf(group, draft("Observation")).unwrap();
        state
    }

    #[test]
    fn first_leaf_and_group_land_under_root() {
        let state = CohortState::default();
        let (state, leaf) = state.add_leaf(NodeId::ROOT, draft("Condition")).unwrap();
        assert_eq!(leaf, id(1));
        assert_eq!(state.tree().leaf(leaf).unwrap().id, leaf);

        let (state, group) = state.add_group(NodeId::ROOT, GroupDraft::new()).unwrap();
        assert_eq!(group, id(-1));
        assert_eq!(state.tree().group(group).unwrap().group_type, GroupType::Or);
        assert!(!state.tree().group(group).unwrap().is_sub_group());
        assert_eq!(state.tree().root().criteria_ids(), ids(&[1, -1]).as_slice());
        assert_consistent(&state);
    }

    #[test]
    fn nested_groups_alternate_and_are_sub_groups() {
        let state = sample();
        let (state, nested) = state.add_group(id(-1), GroupDraft::new()).unwrap();
        let nested = state.tree().group(nested).unwrap();
        assert_eq!(nested.group_type, GroupType::And);
        assert!(nested.is_sub_group());
    }

    #[test]
    fn explicit_kind_overrides_default() {
        let draft = GroupDraft {
            kind: Some(GroupKind::AtLeast),
            ..GroupDraft::new()
        };
        let (state, group) = CohortState::default().add_group(NodeId::ROOT, draft).unwrap();
        assert_eq!(
            state.tree().group(group).unwrap().group_type.kind(),
            GroupKind::AtLeast
        );
    }

    #[test]
    fn policy_can_fix_sub_group_type() {
        let policy = EditPolicy {
            subgroup_default: SubgroupDefault::And,
            ..EditPolicy::default()
        };
        let state = CohortState::default().with_policy(policy);
        let (state, group) = state.add_group(NodeId::ROOT, GroupDraft::new()).unwrap();
        assert_eq!(state.tree().group(group).unwrap().group_type, GroupType::And);
    }

    #[test]
    fn missing_parent_is_rejected_without_side_effects() {
        let state = sample();
        let err = state.add_leaf(id(-9), draft("Condition")).unwrap_err();
        assert_eq!(err, TreeError::NodeNotFound(id(-9)));
        assert_eq!(state.add_group(id(1), GroupDraft::new()).unwrap_err(), TreeError::NotAGroup(id(1)));
        assert_eq!(state.revision(), 4);
        assert_eq!(state.ids().next_leaf_id(), id(4));
    }

    #[test]
    fn ids_are_never_reused_after_deletion() {
        let state = sample();
        let state = state.delete_leaf(id(3)).unwrap();
        let (state, leaf) = state.add_leaf(NodeId::ROOT, draft("Condition")).unwrap();
        assert_eq!(leaf, id(4));
        let state = state.delete_group(id(-1)).unwrap();
        let (_, group) = state.add_group(NodeId::ROOT, GroupDraft::new()).unwrap();
        assert_eq!(group, id(-2));
    }

    #[test]
    fn root_cannot_be_deleted() {
        let state = sample();
        assert_eq!(state.delete_group(NodeId::ROOT).unwrap_err(), TreeError::RootIsUndeletable);
        assert_eq!(state.delete(NodeId::ROOT).unwrap_err(), TreeError::RootIsUndeletable);
        assert!(state.tree().contains(NodeId::ROOT));
    }

    #[test]
    fn deleting_a_group_cascades() {
        let state = sample();
        let (state, nested) = state.add_group(id(-1), GroupDraft::new()).unwrap();
        let (state, deep) = state.add_leaf(nested, draft("Procedure")).unwrap();

        let state = state.delete(id(-1)).unwrap();
        for gone in [id(-1), id(2), id(3), nested, deep] {
            assert!(!state.tree().contains(gone), "{gone} should be deleted");
        }
        assert_eq!(state.tree().root().criteria_ids(), ids(&[1]).as_slice());
        assert_consistent(&state);
    }

    #[test]
    fn deleting_a_group_purges_constraints_on_its_descendants() {
        let state = sample();
        let (state, leaf) = state.add_leaf(NodeId::ROOT, draft("Condition")).unwrap();
        let state = state.add_constraint(constraint(&[2, 3])).unwrap();
        let state = state.add_constraint(constraint(&[1, leaf.get()])).unwrap();

        let state = state.delete_group(id(-1)).unwrap();
        assert_eq!(state.constraints(), [constraint(&[1, leaf.get()])].as_slice());
    }

    #[test]
    fn deleting_a_leaf_purges_constraints_naming_it() {
        let state = sample();
        let state = state.add_constraint(constraint(&[2, 3])).unwrap();
        let state = state.delete_leaf(id(2)).unwrap();
        assert!(state.constraints().is_empty());
        assert_eq!(state.tree().group(id(-1)).unwrap().criteria_ids(), ids(&[3]).as_slice());
    }

    #[test]
    fn delete_checks_node_kind() {
        let state = sample();
        assert_eq!(state.delete_leaf(id(-1)).unwrap_err(), TreeError::NotALeaf(id(-1)));
        assert_eq!(state.delete_group(id(1)).unwrap_err(), TreeError::NotAGroup(id(1)));
        assert_eq!(state.delete(id(42)).unwrap_err(), TreeError::NodeNotFound(id(42)));
    }

    #[test]
    fn duplicate_copies_everything_but_the_id() {
        let state = sample();
        let original = state.tree().leaf(id(2)).unwrap().clone();
        let mut edited = original.clone();
        edited.title = "Insulin".to_string();
        edited.fields.insert("atc".to_string(), json!("A10A"));
        let state = state.edit_leaf(edited.clone()).unwrap();

        let (state, copy_id) = state.duplicate_leaf(id(2)).unwrap();
        assert_eq!(copy_id, id(4));
        let copy = state.tree().leaf(copy_id).unwrap();
        assert_eq!(&Leaf { id: id(2), ..copy.clone() }, &edited);
        assert_eq!(
            state.tree().group(id(-1)).unwrap().criteria_ids(),
            ids(&[2, 3, 4]).as_slice()
        );
        assert_consistent(&state);
    }

    #[test]
    fn duplicate_rejects_groups_and_missing_ids() {
        let state = sample();
        assert_eq!(state.duplicate_leaf(id(-1)).unwrap_err(), TreeError::NotALeaf(id(-1)));
        assert_eq!(state.duplicate_leaf(id(7)).unwrap_err(), TreeError::NodeNotFound(id(7)));
    }

    #[test]
    fn edit_group_keeps_linkage() {
        let state = sample();
        let patch = GroupPatch {
            id: id(-1),
            title: "Treatments".to_string(),
            group_type: GroupType::And,
            is_inclusive: false,
        };
        let state = state.edit_group(patch).unwrap();
        let group = state.tree().group(id(-1)).unwrap();
        assert_eq!(group.title, "Treatments");
        assert!(!group.is_inclusive);
        assert!(!group.is_sub_group());
        assert_eq!(group.criteria_ids(), ids(&[2, 3]).as_slice());
        assert_eq!(state.tree().root().criteria_ids(), ids(&[1, -1]).as_slice());
    }

    #[test]
    fn edit_leaf_rejects_unknown_ids() {
        let state = sample();
        let mut leaf = state.tree().leaf(id(1)).unwrap().clone();
        leaf.id = id(99);
        assert_eq!(state.edit_leaf(leaf).unwrap_err(), TreeError::NodeNotFound(id(99)));
    }

    #[test]
    fn retype_into_n_among_m_resets_threshold() {
        let state = sample();
        let Retype::Applied(state) = state.retype_group(id(-1), GroupKind::AtLeast, false).unwrap() else {
            panic!("no constraints, no confirmation");
        };
        let options = NAmongMOptions {
            number: 2,
            ..NAmongMOptions::fresh(Comparator::GreaterOrEqual)
        };
        let state = state.set_group_options(id(-1), options).unwrap();

        let Retype::Applied(state) = state.retype_group(id(-1), GroupKind::Exactly, false).unwrap() else {
            panic!("no constraints, no confirmation");
        };
        let options = state.tree().group(id(-1)).unwrap().group_type.options().copied();
        assert_eq!(options, Some(NAmongMOptions::fresh(Comparator::Equal)));
    }

    #[test]
    fn retype_to_same_kind_is_idempotent() {
        let state = sample();
        let Retype::Applied(once) = state.retype_group(id(-1), GroupKind::AtMost, false).unwrap() else {
            panic!("expected the change to apply");
        };
        let Retype::Applied(twice) = once.retype_group(id(-1), GroupKind::AtMost, false).unwrap() else {
            panic!("expected the change to apply");
        };
        assert_eq!(once.tree(), twice.tree());
        assert_eq!(once.revision(), twice.revision());
    }

    #[test]
    fn leaving_and_with_constraints_needs_confirmation() {
        let state = sample();
        let state = state.add_constraint(constraint(&[1, -1])).unwrap();

        let outcome = state.retype_group(NodeId::ROOT, GroupKind::Or, false).unwrap();
        assert!(matches!(outcome, Retype::NeedsConfirmation { purged: 1 }));

        let Retype::Applied(confirmed) = state.retype_group(NodeId::ROOT, GroupKind::Or, true).unwrap() else {
            panic!("confirmed change applies");
        };
        assert!(confirmed.constraints().is_empty());
        assert_eq!(confirmed.tree().root().group_type, GroupType::Or);
    }

    #[test]
    fn editing_and_root_to_or_keeps_constraints_until_confirmed() {
        let state = sample();
        let state = state.add_constraint(constraint(&[1, -1])).unwrap();
        let patch = GroupPatch {
            group_type: GroupType::Or,
            ..GroupPatch::from(state.tree().root())
        };

        let err = state.edit_group(patch.clone()).unwrap_err();
        assert_eq!(
            err,
            TreeError::PurgeNeedsConfirmation {
                id: NodeId::ROOT,
                purged: 1,
            }
        );
        assert_eq!(state.constraints().len(), 1);
        assert_eq!(state.tree().root().group_type, GroupType::And);

        let policy = EditPolicy {
            confirm_constraint_purge: false,
            ..EditPolicy::default()
        };
        let edited = state.with_policy(policy).edit_group(patch).unwrap();
        assert!(edited.constraints().is_empty());
        assert_eq!(edited.tree().root().group_type, GroupType::Or);
        assert_consistent(&edited);
    }

    #[test]
    fn editing_and_root_without_invalidated_constraints_applies() {
        let state = sample();
        let state = state.add_constraint(constraint(&[2])).unwrap();
        let patch = GroupPatch {
            title: "Any".to_string(),
            group_type: GroupType::Or,
            ..GroupPatch::from(state.tree().root())
        };
        let edited = state.edit_group(patch).unwrap();
        assert_eq!(edited.tree().root().title, "Any");
        assert_eq!(edited.constraints().len(), 1);
    }

    #[test]
    fn policy_can_skip_confirmation() {
        let policy = EditPolicy {
            confirm_constraint_purge: false,
            ..EditPolicy::default()
        };
        let state = sample().with_policy(policy);
        let state = state.add_constraint(constraint(&[1])).unwrap();
        let outcome = state.retype_group(NodeId::ROOT, GroupKind::Exactly, false).unwrap();
        let Retype::Applied(state) = outcome else {
            panic!("policy disables confirmation");
        };
        assert!(state.constraints().is_empty());
    }

    #[test]
    fn leaving_and_without_constraints_applies_immediately() {
        let state = sample();
        let state = state.add_constraint(constraint(&[2])).unwrap();
        assert_eq!(state.constraints_at_risk(NodeId::ROOT).unwrap(), 0);
        let outcome = state.retype_group(NodeId::ROOT, GroupKind::Or, false).unwrap();
        let Retype::Applied(state) = outcome else {
            panic!("constraint is not attached to the root's members");
        };
        assert_eq!(state.constraints().len(), 1);
    }

    #[test]
    fn threshold_follows_child_count() {
        let state = sample();
        let Retype::Applied(state) = state.retype_group(id(-1), GroupKind::AtLeast, false).unwrap() else {
            panic!("expected the change to apply");
        };
        let number = |state: &CohortState| {
            state.tree().group(id(-1)).unwrap().group_type.options().unwrap().number
        };

        let mut state = state;
        for _ in 0..3 {
            state = state.add_leaf(id(-1), draft("Condition")).unwrap().0;
        }
        assert_eq!(number(&state), 1, "growing never raises the threshold");

        let options = NAmongMOptions {
            number: 5,
            ..NAmongMOptions::fresh(Comparator::GreaterOrEqual)
        };
        let state = state.set_group_options(id(-1), options).unwrap();
        assert_eq!(number(&state), 5);

        let state = state.delete_leaf(id(2)).unwrap();
        assert_eq!(number(&state), 4, "clamped to the new child count");
    }

    #[test]
    fn options_are_clamped_not_rejected() {
        let state = sample();
        let Retype::Applied(state) = state.retype_group(id(-1), GroupKind::AtMost, false).unwrap() else {
            panic!("expected the change to apply");
        };
        let options = NAmongMOptions {
            operator: Comparator::Greater,
            number: 10,
            time_delay_min: 5,
            time_delay_max: 2,
        };
        let state = state.set_group_options(id(-1), options).unwrap();
        let stored = *state.tree().group(id(-1)).unwrap().group_type.options().unwrap();
        assert_eq!(stored.number, 2);
        assert_eq!(stored.time_delay_max, 5);

        assert_eq!(
            state.set_group_options(NodeId::ROOT, options).unwrap_err(),
            TreeError::NoOptions(NodeId::ROOT)
        );
    }

    #[test]
    fn constraints_must_name_live_nodes() {
        let state = sample();
        assert_eq!(
            state.add_constraint(constraint(&[1, 8])).unwrap_err(),
            TreeError::NodeNotFound(id(8))
        );
        let all = TemporalConstraint::new(nonempty![ConstraintTarget::All], ConstraintType::None);
        let state = state.add_constraint(all).unwrap();
        let state = state.remove_constraint(0).unwrap();
        assert!(state.constraints().is_empty());
        assert_eq!(state.remove_constraint(0).unwrap_err(), TreeError::ConstraintNotFound(0));
    }

    #[test]
    fn mutations_invalidate_derived_data() {
        let mut state = sample();
        let counts = StageCounts::from_extra(state.revision(), HashMap::new(), &HashMap::new());
        assert!(state.attach_counts(counts));
        assert!(state.counts().is_some());
        let before = state.composed();

        let (next, _) = state.add_leaf(NodeId::ROOT, draft("Condition")).unwrap();
        assert!(next.counts().is_none());
        assert!(!Arc::ptr_eq(&before, &next.composed()));
        assert!(Arc::ptr_eq(&before, &state.composed()), "old snapshot keeps its cache");

        let stale = StageCounts::from_extra(state.revision(), HashMap::new(), &HashMap::new());
        let mut next = next;
        assert!(!next.attach_counts(stale));
    }

    #[test]
    fn fingerprint_tracks_query_content() {
        let state = sample();
        let same = state.clone();
        assert_eq!(state.fingerprint(), same.fingerprint());

        let mut leaf = state.tree().leaf(id(1)).unwrap().clone();
        leaf.title = "renamed".to_string();
        let renamed = state.edit_leaf(leaf.clone()).unwrap();
        assert_eq!(state.fingerprint(), renamed.fingerprint(), "titles do not affect the query");

        leaf.is_inclusive = false;
        let negated = state.edit_leaf(leaf).unwrap();
        assert_ne!(state.fingerprint(), negated.fingerprint());
    }
}
