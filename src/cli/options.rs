use std::path::PathBuf;

use cohort::{
    domain::{Comparator, NodeId, NodeRef, TreeError},
    Workspace,
};
use tracing::instrument;

use crate::cli::{save, terminal::Colorize};

#[derive(Debug, clap::Parser)]
pub struct Command {
    /// The N-among-M group to change
    id: NodeId,

    /// Comparator: =, <, >, >=
    #[arg(long)]
    operator: Option<Comparator>,

    /// Threshold number of matching children (clamped to the child count)
    #[arg(long, short)]
    number: Option<u32>,

    /// Minimum delay between matching children
    #[arg(long)]
    delay_min: Option<u32>,

    /// Maximum delay between matching children (raised to the minimum if
    /// below it)
    #[arg(long)]
    delay_max: Option<u32>,
}

impl Command {
    #[instrument]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = workspace.load()?;

        let current = match state.tree().get(self.id) {
            Some(NodeRef::Group(group)) => group
                .group_type
                .options()
                .copied()
                .ok_or(TreeError::NoOptions(self.id))?,
            Some(NodeRef::Leaf(_)) => return Err(TreeError::NotAGroup(self.id).into()),
            None => return Err(TreeError::NodeNotFound(self.id).into()),
        };

        let mut options = current;
        if let Some(operator) = self.operator {
            options.operator = operator;
        }
        if let Some(number) = self.number {
            options.number = number;
        }
        if let Some(delay_min) = self.delay_min {
            options.time_delay_min = delay_min;
        }
        if let Some(delay_max) = self.delay_max {
            options.time_delay_max = delay_max;
        }

        let next = state.set_group_options(self.id, options)?;
        let stored = next
            .tree()
            .group(self.id)
            .and_then(|group| group.group_type.options().copied())
            .ok_or(TreeError::NoOptions(self.id))?;
        save(&workspace, &next)?;

        println!(
            "{}",
            format!(
                "✅ Group {} now requires {} {} matching children",
                self.id, stored.operator, stored.number
            )
            .success()
        );
        if stored.time_delay_max > 0 || stored.time_delay_min > 0 {
            println!(
                "{}",
                format!(
                    "Delay between matches: {}..{}",
                    stored.time_delay_min, stored.time_delay_max
                )
                .dim()
            );
        }
        if stored != options {
            println!("{}", "Some values were clamped to fit the group".warning());
        }
        Ok(())
    }
}
