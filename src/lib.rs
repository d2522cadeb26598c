//! Cohort criteria editing
//!
//! A cohort is described by a tree of boolean groups whose leaves are
//! clinical criteria, plus temporal constraints between sibling criteria.

pub mod domain;
pub use domain::{CohortState, Config, NodeId, Tree, TreeError};

/// Filesystem storage for cohorts.
pub mod storage;
pub use storage::Workspace;
