use std::{path::PathBuf, sync::LazyLock};

use cohort::{
    domain::{ConstraintTarget, ConstraintType, TemporalConstraint, TimeSpan},
    Workspace,
};
use nonempty::NonEmpty;
use regex::Regex;
use tracing::instrument;

use crate::cli::{save, terminal::Colorize};

#[derive(Debug, clap::Parser)]
pub struct Command {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Add a temporal constraint
    #[command(allow_negative_numbers = true)]
    Add {
        /// The constrained nodes, or `all` for every criterion of the root
        #[arg(required = true, num_args = 1..)]
        targets: Vec<ConstraintTarget>,

        /// The relation: none, same-encounter, different-encounter,
        /// same-episode-of-care, direct-chronological-ordering
        #[arg(long = "type", short = 't', value_parser = parse_constraint_type, default_value = "none")]
        constraint_type: ConstraintType,

        /// Minimum gap between ordered events, e.g. "1y 6mo" or "3d12h"
        #[arg(long, value_parser = parse_span)]
        min: Option<TimeSpan>,

        /// Maximum gap between ordered events
        #[arg(long, value_parser = parse_span)]
        max: Option<TimeSpan>,
    },

    /// Remove the temporal constraint at the given position
    Remove {
        /// Position as shown by `cohort constraint list`
        index: usize,
    },

    /// List temporal constraints
    List,
}

fn parse_constraint_type(s: &str) -> Result<ConstraintType, String> {
    let normalised: String = s
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect();
    match normalised.as_str() {
        "none" => Ok(ConstraintType::None),
        "sameencounter" => Ok(ConstraintType::SameEncounter),
        "differentencounter" => Ok(ConstraintType::DifferentEncounter),
        "sameepisodeofcare" => Ok(ConstraintType::SameEpisodeOfCare),
        "directchronologicalordering" | "ordered" => Ok(ConstraintType::DirectChronologicalOrdering),
        _ => Err(format!("unknown constraint type '{s}'")),
    }
}

static SPAN_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(y|mo|d|h|min)").expect("span pattern is valid")
});

/// Parse a duration such as `1y 6mo` or `3d12h`.
fn parse_span(s: &str) -> Result<TimeSpan, String> {
    let mut span = TimeSpan::default();
    for captures in SPAN_PART.captures_iter(s) {
        let value: u32 = captures[1]
            .parse()
            .map_err(|_| format!("'{}' is too large", &captures[1]))?;
        match captures[2].to_ascii_lowercase().as_str() {
            "y" => span.years += value,
            "mo" => span.months += value,
            "d" => span.days += value,
            "h" => span.hours += value,
            _ => span.minutes += value,
        }
    }
    let meaningful = s.chars().filter(|c| !c.is_whitespace() && *c != ',').count();
    let consumed = SPAN_PART
        .find_iter(s)
        .map(|m| m.as_str().chars().filter(|c| !c.is_whitespace()).count())
        .sum::<usize>();
    if consumed == 0 || consumed != meaningful {
        return Err(format!(
            "cannot read '{s}' as a duration; use units y, mo, d, h, min (e.g. \"1y 6mo\")"
        ));
    }
    Ok(span)
}

fn format_span(span: &TimeSpan) -> String {
    if span.is_zero() {
        return "0".to_string();
    }
    [
        (span.years, "y"),
        (span.months, "mo"),
        (span.days, "d"),
        (span.hours, "h"),
        (span.minutes, "min"),
    ]
    .iter()
    .filter(|(value, _)| *value > 0)
    .map(|(value, unit)| format!("{value}{unit}"))
    .collect::<Vec<_>>()
    .join(" ")
}

/// One-line description of a constraint, shared with `cohort show`.
pub fn describe(constraint: &TemporalConstraint) -> String {
    let targets = constraint
        .id_list
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let mut line = format!("{} [{targets}]", constraint.constraint_type);
    let min = constraint.time_relation_min_duration.as_ref();
    let max = constraint.time_relation_max_duration.as_ref();
    if min.is_some() || max.is_some() {
        let bound = |span: Option<&TimeSpan>| span.map_or_else(|| "…".to_string(), format_span);
        line.push_str(&format!(" within {}..{}", bound(min), bound(max)));
    }
    line
}

impl Command {
    #[instrument]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = workspace.load()?;

        match self.action {
            Action::Add {
                targets,
                constraint_type,
                min,
                max,
            } => {
                let Some(id_list) = NonEmpty::from_vec(targets) else {
                    anyhow::bail!("a constraint needs at least one target");
                };
                let mut constraint = TemporalConstraint::new(id_list, constraint_type);
                constraint.time_relation_min_duration = min;
                constraint.time_relation_max_duration = max;

                let next = state.add_constraint(constraint)?;
                save(&workspace, &next)?;
                println!(
                    "{}",
                    format!("✅ Added temporal constraint #{}", next.constraints().len() - 1)
                        .success()
                );
            }
            Action::Remove { index } => {
                let next = state.remove_constraint(index)?;
                save(&workspace, &next)?;
                println!(
                    "{}",
                    format!("✅ Removed temporal constraint #{index}").success()
                );
            }
            Action::List => {
                if state.constraints().is_empty() {
                    println!("{}", "No temporal constraints".dim());
                }
                for (index, constraint) in state.constraints().iter().enumerate() {
                    println!("{} {}", format!("#{index}").dim(), describe(constraint));
                }
            }
        }

        Ok(())
    }
}
