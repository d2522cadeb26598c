//! Temporal constraints between sibling criteria.
//!
//! Constraints are stored beside the tree, not inside it, so they have to be
//! reconciled whenever a group changes type or loses members.

use std::{collections::HashSet, fmt};

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::domain::{Group, NodeId};

/// One entry of a constraint's id list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTarget", into = "RawTarget")]
pub enum ConstraintTarget {
    /// Every criterion of the root group.
    All,
    /// A single leaf or group.
    Node(NodeId),
}

impl ConstraintTarget {
    /// The node this target names, unless it is the `All` sentinel.
    #[must_use]
    pub const fn node(self) -> Option<NodeId> {
        match self {
            Self::All => None,
            Self::Node(id) => Some(id),
        }
    }
}

impl fmt::Display for ConstraintTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(ALL_SENTINEL),
            Self::Node(id) => write!(f, "{id}"),
        }
    }
}

impl std::str::FromStr for ConstraintTarget {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case(ALL_SENTINEL) {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Node)
        }
    }
}

const ALL_SENTINEL: &str = "All";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawTarget {
    Id(i64),
    Sentinel(String),
}

/// Error returned when an id list entry is neither an integer nor `All`.
#[derive(Debug, thiserror::Error)]
#[error("expected a node id or \"{ALL_SENTINEL}\", found \"{0}\"")]
pub struct InvalidTarget(String);

impl TryFrom<RawTarget> for ConstraintTarget {
    type Error = InvalidTarget;

    fn try_from(raw: RawTarget) -> Result<Self, Self::Error> {
        match raw {
            RawTarget::Id(id) => Ok(Self::Node(NodeId::new(id))),
            RawTarget::Sentinel(s) if s == ALL_SENTINEL => Ok(Self::All),
            RawTarget::Sentinel(s) => Err(InvalidTarget(s)),
        }
    }
}

impl From<ConstraintTarget> for RawTarget {
    fn from(target: ConstraintTarget) -> Self {
        match target {
            ConstraintTarget::All => Self::Sentinel(ALL_SENTINEL.to_string()),
            ConstraintTarget::Node(id) => Self::Id(id.get()),
        }
    }
}

/// How the events matched by the constrained criteria relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConstraintType {
    /// No relation is imposed.
    #[default]
    None,
    /// The events occur during the same encounter.
    SameEncounter,
    /// The events occur during different encounters.
    DifferentEncounter,
    /// The events occur during the same episode of care.
    SameEpisodeOfCare,
    /// The events occur in the order given by the id list.
    DirectChronologicalOrdering,
}

impl fmt::Display for ConstraintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::SameEncounter => "same-encounter",
            Self::DifferentEncounter => "different-encounter",
            Self::SameEpisodeOfCare => "same-episode-of-care",
            Self::DirectChronologicalOrdering => "direct-chronological-ordering",
        })
    }
}

/// A calendar duration bounding the gap between two ordered events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSpan {
    /// Whole years.
    pub years: u32,
    /// Whole months.
    pub months: u32,
    /// Whole days.
    pub days: u32,
    /// Whole hours.
    pub hours: u32,
    /// Whole minutes.
    pub minutes: u32,
}

impl TimeSpan {
    /// Whether every component is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0 && self.hours == 0 && self.minutes == 0
    }
}

/// A time-ordering rule between criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalConstraint {
    /// The constrained criteria, or the `All` sentinel.
    pub id_list: NonEmpty<ConstraintTarget>,
    /// The relation imposed on the matched events.
    #[serde(default)]
    pub constraint_type: ConstraintType,
    /// Minimum gap between ordered events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_relation_min_duration: Option<TimeSpan>,
    /// Maximum gap between ordered events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_relation_max_duration: Option<TimeSpan>,
}

impl TemporalConstraint {
    /// A constraint of the given type over the given targets, with no
    /// duration bounds.
    #[must_use]
    pub const fn new(id_list: NonEmpty<ConstraintTarget>, constraint_type: ConstraintType) -> Self {
        Self {
            id_list,
            constraint_type,
            time_relation_min_duration: None,
            time_relation_max_duration: None,
        }
    }

    /// The concrete node ids named by this constraint.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.id_list.iter().filter_map(|target| target.node())
    }

    /// Whether the id list contains the `All` sentinel.
    #[must_use]
    pub fn targets_all(&self) -> bool {
        self.id_list.iter().any(|t| *t == ConstraintTarget::All)
    }

    /// Whether any of `ids` appears in the id list.
    #[must_use]
    pub fn mentions_any(&self, ids: &HashSet<NodeId>) -> bool {
        self.node_ids().any(|id| ids.contains(&id))
    }

    /// Whether this constraint survives a structural change to `group`.
    ///
    /// A constraint is kept only if none of its ids is a direct child of the
    /// group, and it does not use the `All` sentinel when the group is the
    /// root.
    #[must_use]
    pub fn is_valid_for(&self, group: &Group) -> bool {
        let touches_members = self
            .node_ids()
            .any(|id| group.criteria_ids().contains(&id));
        let claims_root = group.id.is_root() && self.targets_all();
        !touches_members && !claims_root
    }
}

/// Keeps only the constraints that remain valid for `group`.
#[must_use]
pub fn purge_invalid(constraints: &[TemporalConstraint], group: &Group) -> Vec<TemporalConstraint> {
    constraints
        .iter()
        .filter(|c| c.is_valid_for(group))
        .cloned()
        .collect()
}

/// Counts the constraints that a change to `group` would purge.
#[must_use]
pub fn count_invalidated(constraints: &[TemporalConstraint], group: &Group) -> usize {
    constraints.iter().filter(|c| !c.is_valid_for(group)).count()
}
