use std::path::PathBuf;

use cohort::{
    domain::{NodeId, NodeRef},
    Workspace,
};
use tracing::instrument;

use crate::cli::{prompt_to_proceed, save, terminal::Colorize};

#[derive(Debug, clap::Parser)]
pub struct Command {
    /// The group or criterion to delete
    id: NodeId,

    /// Skip confirmation prompts
    #[arg(long, short)]
    yes: bool,
}

impl Command {
    #[instrument]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = workspace.load()?;

        let next = state.delete(self.id)?;
        let removed = state.tree().len() - next.tree().len();
        let purged = state.constraints().len() - next.constraints().len();

        if !self.yes && (removed > 1 || purged > 0) {
            println!("Will delete {removed} node(s):");
            for entry in state.tree().subtree(self.id) {
                let label = match entry.node {
                    NodeRef::Group(group) => format!("{} group", group.group_type.kind()),
                    NodeRef::Leaf(leaf) => leaf.kind.to_string(),
                };
                println!(
                    "  {}• {label} {} {}",
                    "  ".repeat(entry.depth),
                    entry.node.title(),
                    format!("[{}]", entry.node.id()).dim()
                );
            }
            if purged > 0 {
                println!(
                    "{}",
                    format!("⚠️  {purged} temporal constraint(s) will also be removed").warning()
                );
            }

            if !prompt_to_proceed("Proceed?")? {
                println!("Cancelled");
                return Ok(());
            }
        }

        save(&workspace, &next)?;
        println!(
            "{}",
            format!("✅ Deleted {removed} node(s)").success()
        );
        Ok(())
    }
}
