use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;
use cohort::{
    domain::{
        rebuild::RebuildSignal, tree::SubtreeEntry, CohortState, CountFormat, CountResponse,
        GroupType, NodeId, NodeRef, StageCounts, StageDetails, TreeError,
    },
    Workspace,
};
use serde::Serialize;
use tracing::instrument;

use super::{constraint::describe, terminal::Colorize};

#[derive(Debug, Default, Parser)]
#[command(allow_negative_numbers = true)]
pub struct Show {
    /// Show only the subtree below this node
    #[arg(long, value_name = "ID")]
    from: Option<NodeId>,

    /// A backend count response (JSON with `revision`, `idRemap` and
    /// `extra`) to display beside each node
    #[arg(long, value_name = "FILE")]
    counts: Option<PathBuf>,

    /// Output format
    #[arg(long, value_name = "FORMAT", default_value = "pretty")]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonOutput {
    #[serde(flatten)]
    signal: RebuildSignal,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    counts: BTreeMap<NodeId, StageDetails>,
}

impl Show {
    #[instrument(level = "debug", skip(self))]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let mut state = workspace.load()?;
        let format = CountFormat {
            group_digits: workspace.config().group_digits,
        };

        if let Some(path) = &self.counts {
            if !attach_counts_file(&mut state, path)? {
                println!(
                    "{}",
                    format!(
                        "⚠️  Counts in {} were computed for another revision; not shown",
                        path.display()
                    )
                    .warning()
                );
            }
        }

        let from = self.from.unwrap_or(NodeId::ROOT);
        if !state.tree().contains(from) {
            return Err(TreeError::NodeNotFound(from).into());
        }

        match self.output {
            OutputFormat::Pretty => {
                let narrow = super::terminal::is_narrow();
                for entry in state.tree().subtree(from) {
                    println!("{}", render_line(&entry, &state, format, narrow));
                }
                if from.is_root() && !state.constraints().is_empty() {
                    println!();
                    println!("{}", "Temporal constraints".dim());
                    for (index, constraint) in state.constraints().iter().enumerate() {
                        println!("  {} {}", format!("#{index}").dim(), describe(constraint));
                    }
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&json_output(&state, from, format))?);
            }
        }

        Ok(())
    }
}

/// Reads a backend count response and attaches it to `state`.
///
/// Returns `false` if the response was computed for another revision.
fn attach_counts_file(state: &mut CohortState, path: &Path) -> anyhow::Result<bool> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let response: CountResponse = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let revision = response.revision.with_context(|| {
        format!(
            "{} does not name the revision its counts were computed for",
            path.display()
        )
    })?;
    let counts = StageCounts::from_extra(revision, response.id_remap, &response.extra);
    Ok(state.attach_counts(counts))
}

fn json_output(state: &CohortState, from: NodeId, format: CountFormat) -> JsonOutput {
    let mut signal = RebuildSignal::from_state(state);
    if !from.is_root() {
        if let Some(subtree) = state.tree().compose(from) {
            signal.query = subtree.into();
        }
    }

    let counts = state
        .counts()
        .map(|counts| {
            state
                .tree()
                .subtree(from)
                .filter_map(|entry| {
                    let id = entry.node.id();
                    counts.details(id, format).map(|details| (id, details))
                })
                .collect()
        })
        .unwrap_or_default();

    JsonOutput { signal, counts }
}

fn group_label(group_type: &GroupType) -> String {
    match group_type {
        GroupType::And => "ALL of".to_string(),
        GroupType::Or => "ANY of".to_string(),
        GroupType::NAmongM { options } => format!("{} {} of", options.kind(), options.number),
    }
}

fn render_line(
    entry: &SubtreeEntry<'_>,
    state: &CohortState,
    format: CountFormat,
    narrow: bool,
) -> String {
    let node = entry.node;
    let indent = "  ".repeat(entry.depth);

    let (marker, label) = match node {
        NodeRef::Group(group) => ("▸", group_label(&group.group_type).info()),
        NodeRef::Leaf(leaf) => ("•", leaf.kind.to_string()),
    };

    let mut line = format!("{indent}{marker} ");
    if !node.is_inclusive() {
        line.push_str(&"NOT ".negated());
    }
    line.push_str(&label);
    if !node.title().is_empty() {
        line.push(' ');
        line.push_str(node.title());
    }
    if !narrow {
        line.push(' ');
        line.push_str(&format!("[{}]", node.id()).dim());
    }
    if let Some(details) = state.counts().and_then(|counts| counts.details(node.id(), format)) {
        line.push(' ');
        line.push_str(&format!("({})", details.display).success());
    }
    if let NodeRef::Leaf(leaf) = node {
        if let Some(error) = &leaf.error {
            line.push(' ');
            line.push_str(&format!("⚠️  {error}").warning());
        }
    }
    line
}
