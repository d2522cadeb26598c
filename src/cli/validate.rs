use std::path::PathBuf;

use clap::Parser;
use cohort::{
    domain::{CohortState, GroupType},
    storage::LoadError,
    Workspace,
};
use tracing::instrument;

use super::terminal::Colorize;

#[derive(Debug, Parser)]
#[command(about = "Check the stored cohort for corruption and suspicious settings")]
pub struct Command {
    /// Suppress all output except errors
    #[arg(long, short)]
    quiet: bool,
}

/// Things that load fine but are probably not what the user meant.
#[derive(Debug, PartialEq, Eq)]
enum Warning {
    ThresholdAboveChildren {
        group: i64,
        number: u32,
        children: usize,
    },
    EmptyGroup(i64),
    ConstraintsOnNonAndRoot(usize),
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThresholdAboveChildren {
                group,
                number,
                children,
            } => write!(
                f,
                "group {group} needs {number} matching children but only has {children}"
            ),
            Self::EmptyGroup(group) => write!(f, "group {group} has no children"),
            Self::ConstraintsOnNonAndRoot(count) => write!(
                f,
                "{count} temporal constraint(s) are stored but the root is not an AND group"
            ),
        }
    }
}

fn warnings(state: &CohortState) -> Vec<Warning> {
    let mut warnings = Vec::new();
    for group in state.tree().groups() {
        let children = group.criteria_ids().len();
        if children == 0 && !group.id.is_root() {
            warnings.push(Warning::EmptyGroup(group.id.get()));
        }
        if let GroupType::NAmongM { options } = &group.group_type {
            if usize::try_from(options.number).is_ok_and(|number| number > children) {
                warnings.push(Warning::ThresholdAboveChildren {
                    group: group.id.get(),
                    number: options.number,
                    children,
                });
            }
        }
    }
    let root = state.tree().root();
    if !root.group_type.supports_temporal_constraints() && !state.constraints().is_empty() {
        warnings.push(Warning::ConstraintsOnNonAndRoot(state.constraints().len()));
    }
    warnings
}

impl Command {
    #[instrument(level = "debug", skip(self))]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = match workspace.load() {
            Ok(state) => state,
            Err(LoadError::Integrity(errors)) => {
                for error in &errors {
                    eprintln!("{}", format!("❌ {error}").warning());
                }
                anyhow::bail!("found {} integrity error(s)", errors.len());
            }
            Err(e) => return Err(e.into()),
        };

        let warnings = warnings(&state);
        if self.quiet {
            return Ok(());
        }

        for warning in &warnings {
            println!("{}", format!("⚠️  {warning}").warning());
        }

        let groups = state.tree().groups().count();
        let leaves = state.tree().leaves().count();
        println!(
            "{}",
            format!(
                "✅ Cohort is consistent: {groups} group(s), {leaves} criteria, {} temporal \
                 constraint(s)",
                state.constraints().len()
            )
            .success()
        );
        Ok(())
    }
}
