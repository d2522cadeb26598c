//! Selected criteria: the leaves of the criteria tree.
//!
//! The engine only reads a leaf's id and inclusion flag. Everything else
//! belongs to the criterion catalog and is carried through untouched.

use std::collections::BTreeMap;

use non_empty_string::NonEmptyString;
use serde::{Deserialize, Serialize};

use crate::domain::NodeId;

/// Criterion-specific fields, opaque to the engine.
pub type CriterionFields = BTreeMap<String, serde_json::Value>;

/// A concrete clinical filter with no children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaf {
    /// The leaf's identifier (always positive).
    pub id: NodeId,
    /// The criterion kind, as named by the criterion catalog.
    #[serde(rename = "type")]
    pub kind: NonEmptyString,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// When `false` the criterion is negated.
    pub is_inclusive: bool,
    /// A validation message attached by the criterion's form, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Criterion-specific fields.
    #[serde(flatten)]
    pub fields: CriterionFields,
}

impl Leaf {
    /// Builds a leaf from a draft and the identifier allocated for it.
    #[must_use]
    pub fn from_draft(id: NodeId, draft: LeafDraft) -> Self {
        Self {
            id,
            kind: draft.kind,
            title: draft.title,
            is_inclusive: draft.is_inclusive,
            error: draft.error,
            fields: draft.fields,
        }
    }

    /// A copy of this leaf under a new identifier.
    #[must_use]
    pub fn duplicate_as(&self, id: NodeId) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

impl From<Leaf> for LeafDraft {
    fn from(leaf: Leaf) -> Self {
        Self {
            kind: leaf.kind,
            title: leaf.title,
            is_inclusive: leaf.is_inclusive,
            error: leaf.error,
            fields: leaf.fields,
        }
    }
}

/// The caller-supplied part of a new leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafDraft {
    /// The criterion kind.
    pub kind: NonEmptyString,
    /// Display title.
    pub title: String,
    /// When `false` the criterion is negated.
    pub is_inclusive: bool,
    /// A validation message, if any.
    pub error: Option<String>,
    /// Criterion-specific fields.
    pub fields: CriterionFields,
}

impl LeafDraft {
    /// An inclusive draft of the given kind with no fields.
    #[must_use]
    pub fn new(kind: NonEmptyString) -> Self {
        Self {
            kind,
            title: String::new(),
            is_inclusive: true,
            error: None,
            fields: CriterionFields::new(),
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Adds a criterion-specific field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}
