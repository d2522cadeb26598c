//! Boolean criteria groups and the rules for changing their type.

use std::{fmt, str::FromStr};

use borsh::BorshSerialize;
use serde::{Deserialize, Serialize};

use crate::domain::NodeId;

/// Comparator applied to the number of matching children of an
/// N-among-M group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize)]
pub enum Comparator {
    /// Exactly `number` children must match.
    #[serde(rename = "=")]
    Equal,
    /// Fewer than `number` children must match.
    #[serde(rename = "<")]
    Less,
    /// Stored for "at most" groups.
    #[serde(rename = ">")]
    Greater,
    /// At least `number` children must match.
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Equal => "=",
            Self::Less => "<",
            Self::Greater => ">",
            Self::GreaterOrEqual => "≥",
        };
        f.write_str(symbol)
    }
}

impl FromStr for Comparator {
    type Err = UnknownComparator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" | "eq" => Ok(Self::Equal),
            "<" | "lt" => Ok(Self::Less),
            ">" | "gt" => Ok(Self::Greater),
            ">=" | "≥" | "ge" => Ok(Self::GreaterOrEqual),
            other => Err(UnknownComparator(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognised comparator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown comparator '{0}': expected one of =, <, >, >=")]
pub struct UnknownComparator(String);

/// Numeric options of an N-among-M group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize)]
#[serde(rename_all = "camelCase")]
pub struct NAmongMOptions {
    /// How the count of matching children is compared to `number`.
    pub operator: Comparator,
    /// The threshold number of matching children.
    pub number: u32,
    /// Minimum delay between matching children.
    #[serde(default)]
    pub time_delay_min: u32,
    /// Maximum delay between matching children.
    #[serde(default)]
    pub time_delay_max: u32,
}

impl NAmongMOptions {
    /// Fresh options for the given comparator, with a threshold of one and no
    /// delay window.
    #[must_use]
    pub const fn fresh(operator: Comparator) -> Self {
        Self {
            operator,
            number: 1,
            time_delay_min: 0,
            time_delay_max: 0,
        }
    }

    /// Re-applies the threshold post-condition for a group with
    /// `child_count` children.
    ///
    /// A zero threshold is raised to one once the group has a child, and a
    /// threshold above the child count is clamped down to it. Returns `true`
    /// if the threshold changed.
    pub fn fit_to(&mut self, child_count: usize) -> bool {
        let count = u32::try_from(child_count).unwrap_or(u32::MAX);
        let fitted = if self.number == 0 && count > 0 {
            1
        } else {
            self.number.min(count)
        };
        let changed = fitted != self.number;
        self.number = fitted;
        changed
    }

    /// The operator kind a user would recognise for these options.
    #[must_use]
    pub const fn kind(&self) -> GroupKind {
        match self.operator {
            Comparator::GreaterOrEqual => GroupKind::AtLeast,
            Comparator::Equal => GroupKind::Exactly,
            Comparator::Greater | Comparator::Less => GroupKind::AtMost,
        }
    }
}

/// The stored type of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupType {
    /// Every child must match.
    And,
    /// At least one child must match.
    Or,
    /// A comparator-qualified number of children must match.
    NAmongM {
        /// Threshold and delay options.
        options: NAmongMOptions,
    },
}

impl GroupType {
    /// The operator kind a user would recognise for this type.
    #[must_use]
    pub const fn kind(&self) -> GroupKind {
        match self {
            Self::And => GroupKind::And,
            Self::Or => GroupKind::Or,
            Self::NAmongM { options } => options.kind(),
        }
    }

    /// Whether temporal constraints can be attached to a group of this type.
    #[must_use]
    pub const fn supports_temporal_constraints(&self) -> bool {
        matches!(self, Self::And)
    }

    /// The numeric options, for N-among-M groups.
    #[must_use]
    pub const fn options(&self) -> Option<&NAmongMOptions> {
        match self {
            Self::NAmongM { options } => Some(options),
            Self::And | Self::Or => None,
        }
    }

    /// The default type for a new sub-group of a group of this type.
    ///
    /// AND parents get OR children; anything else gets AND children.
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::And => Self::Or,
            Self::Or | Self::NAmongM { .. } => Self::And,
        }
    }
}

/// The operator kinds a user can request for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKind {
    /// Every child must match.
    And,
    /// At least one child must match.
    Or,
    /// At least `n` children must match.
    AtLeast,
    /// At most `n` children must match.
    AtMost,
    /// Exactly `n` children must match.
    Exactly,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::AtLeast => "AT-LEAST",
            Self::AtMost => "AT-MOST",
            Self::Exactly => "EXACTLY",
        };
        f.write_str(name)
    }
}

/// Error returned when a group kind name is not recognised.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown group kind '{0}': expected one of AND, OR, AT-LEAST, AT-MOST, EXACTLY")]
pub struct UnknownGroupKind(String);

impl FromStr for GroupKind {
    type Err = UnknownGroupKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            "AT-LEAST" => Ok(Self::AtLeast),
            "AT-MOST" => Ok(Self::AtMost),
            "EXACTLY" => Ok(Self::Exactly),
            _ => Err(UnknownGroupKind(s.to_string())),
        }
    }
}

/// Maps a requested operator kind to the stored group type.
///
/// Entering N-among-M always starts from a threshold of one, whatever
/// options the group held before.
#[must_use]
pub const fn resolve_transition(requested: GroupKind) -> GroupType {
    match requested {
        GroupKind::And => GroupType::And,
        GroupKind::Or => GroupType::Or,
        GroupKind::AtLeast => GroupType::NAmongM {
            options: NAmongMOptions::fresh(Comparator::GreaterOrEqual),
        },
        GroupKind::AtMost => GroupType::NAmongM {
            options: NAmongMOptions::fresh(Comparator::Greater),
        },
        GroupKind::Exactly => GroupType::NAmongM {
            options: NAmongMOptions::fresh(Comparator::Equal),
        },
    }
}

/// An internal boolean node of the criteria tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// The group's identifier (never positive).
    pub id: NodeId,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// The stored type and, for N-among-M groups, its options.
    #[serde(flatten)]
    pub group_type: GroupType,
    /// Ordered child identifiers.
    #[serde(default)]
    pub(crate) criteria_ids: Vec<NodeId>,
    /// When `false` the group's matching condition is negated.
    pub is_inclusive: bool,
    /// Whether this group sits below another group.
    pub(crate) is_sub_group: bool,
}

impl Group {
    /// A childless root group of the given type.
    #[must_use]
    pub fn root(group_type: GroupType) -> Self {
        Self {
            id: NodeId::ROOT,
            title: String::new(),
            group_type,
            criteria_ids: Vec::new(),
            is_inclusive: true,
            is_sub_group: false,
        }
    }

    /// The ordered identifiers of this group's children.
    #[must_use]
    pub fn criteria_ids(&self) -> &[NodeId] {
        &self.criteria_ids
    }

    /// Whether this group has a parent group.
    #[must_use]
    pub const fn is_sub_group(&self) -> bool {
        self.is_sub_group
    }

    /// Re-applies the N-among-M threshold post-condition against the current
    /// child count. Returns `true` if anything changed.
    pub(crate) fn refit_threshold(&mut self) -> bool {
        let child_count = self.criteria_ids.len();
        match &mut self.group_type {
            GroupType::NAmongM { options } => options.fit_to(child_count),
            GroupType::And | GroupType::Or => false,
        }
    }
}

/// The caller-supplied part of a new group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDraft {
    /// Display title.
    pub title: String,
    /// Requested operator kind. `None` lets the store pick the default
    /// sub-group type.
    pub kind: Option<GroupKind>,
    /// When `false` the group's matching condition is negated.
    pub is_inclusive: bool,
}

impl GroupDraft {
    /// An inclusive, untitled draft with the default type.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_inclusive: true,
            ..Self::default()
        }
    }
}

/// Replacement content for an existing group.
///
/// Linkage (children and the sub-group flag) is owned by the store and
/// cannot be changed through a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPatch {
    /// The group to replace.
    pub id: NodeId,
    /// New title.
    pub title: String,
    /// New type and options.
    pub group_type: GroupType,
    /// New inclusion flag.
    pub is_inclusive: bool,
}

impl From<&Group> for GroupPatch {
    fn from(group: &Group) -> Self {
        Self {
            id: group.id,
            title: group.title.clone(),
            group_type: group.group_type,
            is_inclusive: group.is_inclusive,
        }
    }
}
