use std::{fmt, num::ParseIntError, str::FromStr};

use borsh::BorshSerialize;
use serde::{Deserialize, Serialize};

/// Identifier of a node in the criteria tree.
///
/// Leaves are allocated strictly positive identifiers and groups
/// non-positive ones. The root group is always [`NodeId::ROOT`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
)]
#[serde(transparent)]
pub struct NodeId(i64);

impl NodeId {
    /// The root group. It always exists and can never be deleted.
    pub const ROOT: Self = Self(0);

    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw signed value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether this is the root group's identifier.
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    /// Whether this identifier lies in the range handed out to leaves.
    #[must_use]
    pub const fn in_leaf_range(self) -> bool {
        self.0 > 0
    }

    /// Whether this identifier lies in the range handed out to groups.
    #[must_use]
    pub const fn in_group_range(self) -> bool {
        self.0 <= 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<i64> for NodeId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// The pair of counters used to hand out fresh node identifiers.
///
/// The counters are part of the persisted state rather than process-wide
/// statics, so they travel with every snapshot of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    next_criteria_id: i64,
    next_group_id: i64,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next_criteria_id: 1,
            next_group_id: -1,
        }
    }
}

impl IdAllocator {
    /// Rebuilds an allocator from persisted counter values.
    #[must_use]
    pub const fn from_counters(next_criteria_id: i64, next_group_id: i64) -> Self {
        Self {
            next_criteria_id,
            next_group_id,
        }
    }

    /// The identifier the next leaf will receive, without consuming it.
    #[must_use]
    pub const fn next_leaf_id(&self) -> NodeId {
        NodeId(self.next_criteria_id)
    }

    /// The identifier the next group will receive, without consuming it.
    #[must_use]
    pub const fn next_group_id(&self) -> NodeId {
        NodeId(self.next_group_id)
    }

    /// Hands out a leaf identifier and advances the counter.
    pub const fn allocate_leaf(&mut self) -> NodeId {
        let id = self.next_leaf_id();
        self.next_criteria_id += 1;
        id
    }

    /// Hands out a group identifier and advances the counter.
    pub const fn allocate_group(&mut self) -> NodeId {
        let id = self.next_group_id();
        self.next_group_id -= 1;
        id
    }

    /// Whether `id` could have been handed out by this allocator already.
    ///
    /// Any live node must satisfy this, otherwise a future allocation would
    /// collide with it.
    #[must_use]
    pub const fn has_issued(&self, id: NodeId) -> bool {
        if id.in_leaf_range() {
            id.0 < self.next_criteria_id
        } else {
            id.0 > self.next_group_id
        }
    }

    /// Raw counter values, `(next_criteria_id, next_group_id)`.
    #[must_use]
    pub const fn counters(&self) -> (i64, i64) {
        (self.next_criteria_id, self.next_group_id)
    }
}
