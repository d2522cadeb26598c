//! A directory holding one cohort.
//!
//! The [`Workspace`] binds a root directory to the files inside it:
//!
//! - `config.toml`, the editing [`Config`]
//! - `cohort.yaml`, the persisted cohort (see [`CohortDocument`])
//! - `query.json`, the last query handed to the backend (see [`QueryFile`])

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::Utc;

use crate::{
    domain::{
        CohortState, Config, ConfigError, EditPolicy, QueryBuilder, RebuildQueue, RebuildSignal,
    },
    storage::document::{CohortDocument, LoadError, SaveError},
};

const CONFIG_FILE: &str = "config.toml";
const COHORT_FILE: &str = "cohort.yaml";
const QUERY_FILE: &str = "query.json";

/// Errors raised while creating a workspace.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A cohort already exists in the directory.
    #[error("a cohort already exists at {0}")]
    AlreadyInitialised(String),
    /// The directory could not be created.
    #[error("failed to create workspace directory: {0}")]
    Io(#[from] io::Error),
    /// The configuration file could not be written.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The empty cohort could not be written.
    #[error(transparent)]
    Save(#[from] SaveError),
}

/// A filesystem backed cohort.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    config: Config,
}

impl Workspace {
    /// Opens the workspace at `root`.
    ///
    /// A missing or unreadable configuration file falls back to the
    /// defaults.
    #[must_use]
    pub fn open(root: PathBuf) -> Self {
        let config = load_config(&root);
        Self { root, config }
    }

    /// Creates a workspace at `root` with the default configuration and an
    /// empty cohort whose root group is AND.
    ///
    /// # Errors
    ///
    /// Fails if a cohort already exists there or if any file cannot be
    /// written.
    pub fn init(root: PathBuf) -> Result<Self, InitError> {
        let cohort_path = root.join(COHORT_FILE);
        if cohort_path.exists() {
            return Err(InitError::AlreadyInitialised(root.display().to_string()));
        }
        std::fs::create_dir_all(&root)?;

        let config_path = root.join(CONFIG_FILE);
        let config = if config_path.exists() {
            load_config(&root)
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            config
        };

        let workspace = Self { root, config };
        workspace.save(&CohortState::default())?;
        Ok(workspace)
    }

    /// The workspace directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The configuration in force.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Replaces the configuration and writes it to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be written.
    pub fn set_config(&mut self, config: Config) -> Result<(), ConfigError> {
        config.save(&self.config_path())?;
        self.config = config;
        Ok(())
    }

    /// Path of the configuration file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Path of the cohort document.
    #[must_use]
    pub fn cohort_path(&self) -> PathBuf {
        self.root.join(COHORT_FILE)
    }

    /// Path of the query file.
    #[must_use]
    pub fn query_path(&self) -> PathBuf {
        self.root.join(QUERY_FILE)
    }

    /// Loads the cohort, applying the configured edit policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is missing, unreadable or corrupt.
    pub fn load(&self) -> Result<CohortState, LoadError> {
        let state = CohortDocument::load(&self.cohort_path())?.into_state()?;
        tracing::debug!(
            nodes = state.tree().len(),
            constraints = state.constraints().len(),
            "Loaded cohort"
        );
        Ok(state.with_policy(EditPolicy::from(&self.config)))
    }

    /// Writes the cohort.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be encoded or written.
    pub fn save(&self, state: &CohortState) -> Result<(), SaveError> {
        CohortDocument::from_state(state, Utc::now()).save(&self.cohort_path())
    }

    /// The query file of this workspace.
    #[must_use]
    pub fn query_file(&self) -> QueryFile {
        QueryFile::new(self.query_path())
    }

    /// Writes the cohort and, if its query changed, the query file.
    ///
    /// Returns `true` if the query file was rewritten.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be written.
    pub fn commit(&self, state: &CohortState) -> Result<bool, SaveError> {
        self.save(state)?;

        let mut query_file = self.query_file();
        let mut queue = query_file
            .last_fingerprint()
            .map_or_else(RebuildQueue::default, RebuildQueue::delivered);
        if !queue.notify(state) {
            return Ok(false);
        }
        Ok(queue.flush(&mut query_file)?.is_some())
    }
}

fn load_config(root: &Path) -> Config {
    let path = root.join(CONFIG_FILE);
    Config::load(&path).unwrap_or_else(|e| {
        tracing::debug!("Failed to load config: {e}");
        Config::default()
    })
}

/// A [`QueryBuilder`] that writes each rebuild signal to a JSON file for the
/// backend to pick up.
#[derive(Debug, Clone)]
pub struct QueryFile {
    path: PathBuf,
}

impl QueryFile {
    /// A query file at `path`.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The fingerprint recorded in the file, if it exists and is readable.
    #[must_use]
    pub fn last_fingerprint(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let value: serde_json::Value = serde_json::from_str(&content).ok()?;
        value.get("fingerprint")?.as_str().map(ToString::to_string)
    }
}

impl QueryBuilder for QueryFile {
    type Error = SaveError;

    fn rebuild(&mut self, signal: &RebuildSignal) -> Result<(), Self::Error> {
        let content = serde_json::to_string_pretty(signal).map_err(io::Error::from)?;
        std::fs::write(&self.path, content)?;
        tracing::info!("Wrote query for revision {} to {}", signal.revision, self.path.display());
        Ok(())
    }
}
