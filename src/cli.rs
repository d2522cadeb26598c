use std::path::{Path, PathBuf};

mod add;
mod config;
mod constraint;
mod delete;
mod edit;
mod options;
mod retype;
mod show;
mod terminal;
mod validate;

use anyhow::Context;
use clap::ArgAction;
use cohort::{
    domain::{CohortState, NodeId},
    storage::InitError,
    Workspace,
};
use non_empty_string::NonEmptyString;
use show::Show;
use terminal::Colorize;
use tracing::instrument;

/// Parse a criterion kind, which must not be empty.
fn parse_criterion_kind(s: &str) -> Result<NonEmptyString, String> {
    NonEmptyString::new(s.trim().to_string()).map_err(|_| "criterion kind cannot be empty".to_string())
}

/// Parse a `key=value` criterion field.
///
/// The value is read as JSON when it parses as JSON, and as a plain string
/// otherwise, so `--field code=E11` and `--field age=42` both do the obvious
/// thing.
fn parse_field(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, found '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("field name cannot be empty".to_string());
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Resolve a pair of `--include`/`--exclude` flags into an inclusion flag.
const fn inclusion(include: bool, exclude: bool) -> Option<bool> {
    match (include, exclude) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    }
}

#[derive(Debug, clap::Parser)]
#[command(version, about)]
pub struct Cli {
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global=true)]
    verbose: u8,

    /// The directory holding the cohort
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        Self::setup_logging(self.verbose);

        self.command
            .unwrap_or_else(|| Command::Show(Show::default()))
            .run(self.root)
    }

    fn setup_logging(verbosity: u8) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let level = match verbosity {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        };

        let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_names(false)
            .with_line_number(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

#[derive(Debug, clap::Parser)]
pub enum Command {
    /// Show the criteria tree (default)
    Show(Show),

    /// Create an empty cohort
    Init,

    /// Add a group or a criterion
    Add(add::Command),

    /// Edit a group or a criterion
    Edit(edit::Command),

    /// Delete a group (with everything below it) or a criterion
    #[command(allow_negative_numbers = true)]
    Delete(delete::Command),

    /// Copy a criterion into the same group
    #[command(allow_negative_numbers = true)]
    Duplicate(Duplicate),

    /// Change the operator of a group
    #[command(allow_negative_numbers = true)]
    Retype(retype::Command),

    /// Set the threshold and delay window of an N-among-M group
    #[command(allow_negative_numbers = true)]
    Options(options::Command),

    /// Manage temporal constraints
    Constraint(constraint::Command),

    /// Check the cohort for structural problems
    Validate(validate::Command),

    /// Show or modify configuration settings
    Config(config::Command),
}

impl Command {
    fn run(self, root: PathBuf) -> anyhow::Result<()> {
        match self {
            Self::Show(command) => command.run(root)?,
            Self::Init => init(&root)?,
            Self::Add(command) => command.run(root)?,
            Self::Edit(command) => command.run(root)?,
            Self::Delete(command) => command.run(root)?,
            Self::Duplicate(command) => command.run(root)?,
            Self::Retype(command) => command.run(root)?,
            Self::Options(command) => command.run(root)?,
            Self::Constraint(command) => command.run(root)?,
            Self::Validate(command) => command.run(root)?,
            Self::Config(command) => command.run(root)?,
        }
        Ok(())
    }
}

#[instrument]
fn init(root: &Path) -> anyhow::Result<()> {
    let workspace = match Workspace::init(root.to_path_buf()) {
        Ok(workspace) => workspace,
        Err(InitError::AlreadyInitialised(_)) => {
            anyhow::bail!("Cohort already initialized (found existing cohort.yaml)")
        }
        Err(e) => return Err(e).context("Failed to initialize cohort"),
    };

    println!("Initialized cohort in {}", workspace.root().display());
    println!("  Created: config.toml");
    println!("  Created: cohort.yaml");
    println!();
    println!("Next steps:");
    println!("  cohort add leaf 0 Condition --title \"Your first criterion\"");
    Ok(())
}

#[derive(Debug, clap::Parser)]
pub struct Duplicate {
    /// The criterion to copy
    id: NodeId,
}

impl Duplicate {
    #[instrument]
    fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = workspace.load()?;

        let (next, copy) = state.duplicate_leaf(self.id)?;
        save(&workspace, &next)?;

        println!(
            "{}",
            format!("✅ Duplicated criterion {} as {copy}", self.id).success()
        );
        Ok(())
    }
}

/// Persist `state` and tell the user whether the backend query changed.
fn save(workspace: &Workspace, state: &CohortState) -> anyhow::Result<()> {
    let rebuilt = workspace.commit(state).context("Failed to save cohort")?;
    if rebuilt {
        tracing::debug!("Query rebuilt at revision {}", state.revision());
    } else {
        tracing::debug!("Query unchanged");
    }
    Ok(())
}

/// Ask the user to confirm a destructive change.
///
/// Returns `false` if the user declines. Fails when there is no terminal to
/// ask on, so scripts must pass `--yes`.
fn prompt_to_proceed(question: &str) -> anyhow::Result<bool> {
    dialoguer::Confirm::new()
        .with_prompt(question)
        .default(false)
        .interact()
        .context("Cannot ask for confirmation; pass --yes to proceed")
}
