//! The on-disk form of a cohort.
//!
//! A cohort is stored as a single YAML document holding the id counters,
//! every group, every criterion and the temporal constraints. Counts and
//! other derived data are never written.

use std::{io, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CohortState, Group, IdAllocator, IntegrityError, Leaf, TemporalConstraint, Tree,
};

/// A cohort as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "DocumentVersion", into = "DocumentVersion")]
pub struct CohortDocument {
    /// When the document was last written.
    pub saved: DateTime<Utc>,
    /// The revision of the saved state.
    pub revision: u64,
    /// The id counters.
    pub ids: IdAllocator,
    /// Every group, in id order.
    pub groups: Vec<Group>,
    /// Every criterion.
    pub criteria: Vec<Leaf>,
    /// Temporal constraints, in order.
    pub temporal_constraints: Vec<TemporalConstraint>,
}

/// Errors that can occur when loading a cohort document.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The document does not exist.
    #[error("no cohort found at {0}; run `cohort init` first")]
    NotFound(String),
    /// An I/O error occurred.
    #[error("failed to read cohort: {0}")]
    Io(#[from] io::Error),
    /// The YAML could not be parsed.
    #[error("failed to parse cohort: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// The document parsed but describes a corrupt tree.
    #[error("cohort is corrupt: {}", summarise(.0))]
    Integrity(Vec<IntegrityError>),
}

fn summarise(errors: &[IntegrityError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur when saving a cohort document.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// An I/O error occurred.
    #[error("failed to write cohort: {0}")]
    Io(#[from] io::Error),
    /// The document could not be encoded.
    #[error("failed to serialize cohort: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CohortDocument {
    /// Captures the persistent parts of `state`.
    #[must_use]
    pub fn from_state(state: &CohortState, saved: DateTime<Utc>) -> Self {
        let tree = state.tree();
        Self {
            saved,
            revision: state.revision(),
            ids: *state.ids(),
            groups: tree.groups().cloned().collect(),
            criteria: tree.leaves().cloned().collect(),
            temporal_constraints: state.constraints().to_vec(),
        }
    }

    /// Rebuilds a state from the document, checking every structural
    /// invariant.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Integrity`] listing every violation found.
    pub fn into_state(self) -> Result<CohortState, LoadError> {
        let tree = Tree::from_parts(self.groups, self.criteria, &self.ids)
            .map_err(LoadError::Integrity)?;

        let missing: Vec<_> = self
            .temporal_constraints
            .iter()
            .flat_map(TemporalConstraint::node_ids)
            .filter(|&id| !tree.contains(id))
            .map(IntegrityError::DanglingConstraint)
            .collect();
        if !missing.is_empty() {
            return Err(LoadError::Integrity(missing));
        }

        Ok(CohortState::new(tree, self.temporal_constraints, self.ids).at_revision(self.revision))
    }

    /// Reads a document from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or not a valid
    /// cohort document.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LoadError::NotFound(path.display().to_string()),
            _ => LoadError::Io(e),
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Writes the document to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be encoded or written.
    pub fn save(&self, path: &Path) -> Result<(), SaveError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved cohort to {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_version")]
enum DocumentVersion {
    #[serde(rename = "1")]
    V1 {
        saved: DateTime<Utc>,
        #[serde(default)]
        revision: u64,
        #[serde(rename = "nextCriteriaId")]
        next_criteria_id: i64,
        #[serde(rename = "nextGroupId")]
        next_group_id: i64,
        groups: Vec<Group>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        criteria: Vec<Leaf>,
        #[serde(
            rename = "temporalConstraints",
            default,
            skip_serializing_if = "Vec::is_empty"
        )]
        temporal_constraints: Vec<TemporalConstraint>,
    },
}

impl From<DocumentVersion> for CohortDocument {
    fn from(version: DocumentVersion) -> Self {
        match version {
            DocumentVersion::V1 {
                saved,
                revision,
                next_criteria_id,
                next_group_id,
                groups,
                criteria,
                temporal_constraints,
            } => Self {
                saved,
                revision,
                ids: IdAllocator::from_counters(next_criteria_id, next_group_id),
                groups,
                criteria,
                temporal_constraints,
            },
        }
    }
}

impl From<CohortDocument> for DocumentVersion {
    fn from(document: CohortDocument) -> Self {
        let CohortDocument {
            saved,
            revision,
            ids,
            groups,
            criteria,
            temporal_constraints,
        } = document;
        let (next_criteria_id, next_group_id) = ids.counters();
        Self::V1 {
            saved,
            revision,
            next_criteria_id,
            next_group_id,
            groups,
            criteria,
            temporal_constraints,
        }
    }
}
