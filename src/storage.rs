/// The persisted cohort document.
pub mod document;
mod workspace;

pub use document::{CohortDocument, LoadError, SaveError};
pub use workspace::{InitError, QueryFile, Workspace};
