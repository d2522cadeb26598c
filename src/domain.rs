//! The cohort criteria engine.
//!
//! This module contains the criteria tree, its groups and leaves, temporal
//! constraints, the reducers that edit them, and the derived data consumers
//! read (composed views, fingerprints and population counts).

mod config;
pub use config::{Config, ConfigError, SubgroupDefault};

/// Temporal constraints and their validity rules.
pub mod constraint;
pub use constraint::{ConstraintTarget, ConstraintType, TemporalConstraint, TimeSpan};

pub mod counts;
pub use counts::{CountFormat, CountRequests, CountResponse, StageCounts, StageDetails};

/// Boolean groups and group-type transitions.
pub mod group;
pub use group::{
    resolve_transition, Comparator, Group, GroupDraft, GroupKind, GroupPatch, GroupType,
    NAmongMOptions,
};

mod id;
pub use id::{IdAllocator, NodeId};

mod leaf;
pub use leaf::{CriterionFields, Leaf, LeafDraft};

pub mod rebuild;
pub use rebuild::{QueryBuilder, RebuildQueue, RebuildSignal};

mod session;
pub use session::{LeafEditSession, LeafTarget};

mod state;
pub use state::{CohortState, EditPolicy, Retype, TreeError};

pub mod tree;
pub use tree::{ComposedNode, IntegrityError, Node, NodeRef, Tree};
