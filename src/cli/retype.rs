use std::path::PathBuf;

use cohort::{
    domain::{GroupKind, NodeId, Retype},
    Workspace,
};
use tracing::instrument;

use crate::cli::{prompt_to_proceed, save, terminal::Colorize};

#[derive(Debug, clap::Parser)]
pub struct Command {
    /// The group to change
    id: NodeId,

    /// The new operator: and, or, at-least, at-most, exactly
    kind: GroupKind,

    /// Drop invalidated temporal constraints without asking
    #[arg(long, short)]
    yes: bool,
}

impl Command {
    #[instrument]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = workspace.load()?;

        let next = match state.retype_group(self.id, self.kind, self.yes)? {
            Retype::Applied(next) => next,
            Retype::NeedsConfirmation { purged } => {
                println!(
                    "{}",
                    format!(
                        "⚠️  Only AND groups can hold temporal constraints. Changing group {} to \
                         {} will remove {purged} constraint(s).",
                        self.id, self.kind
                    )
                    .warning()
                );
                if !prompt_to_proceed("Proceed?")? {
                    println!("Cancelled");
                    return Ok(());
                }
                match state.retype_group(self.id, self.kind, true)? {
                    Retype::Applied(next) => next,
                    Retype::NeedsConfirmation { .. } => {
                        anyhow::bail!("confirmed change to group {} was not applied", self.id)
                    }
                }
            }
        };

        if next.revision() == state.revision() {
            println!("Group {} is already {}", self.id, self.kind);
            return Ok(());
        }

        let purged = state.constraints().len() - next.constraints().len();
        save(&workspace, &next)?;
        println!(
            "{}",
            format!("✅ Group {} is now {}", self.id, self.kind).success()
        );
        if purged > 0 {
            println!("{}", format!("Removed {purged} temporal constraint(s)").dim());
        }
        Ok(())
    }
}
