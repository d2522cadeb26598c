use std::path::PathBuf;

use cohort::{
    domain::{GroupPatch, Leaf, LeafDraft, NodeId, TreeError},
    Workspace,
};
use tracing::instrument;

use crate::cli::{inclusion, parse_field, save, terminal::Colorize};

#[derive(Debug, clap::Parser)]
pub struct Command {
    #[command(subcommand)]
    target: Target,
}

#[derive(Debug, clap::Subcommand)]
enum Target {
    /// Edit a group's title or inclusion
    ///
    /// Use `cohort retype` to change the operator and `cohort options` to
    /// change an N-among-M threshold.
    #[command(allow_negative_numbers = true)]
    Group {
        /// The group to edit
        id: NodeId,

        /// New display title
        #[arg(long, short)]
        title: Option<String>,

        /// Make the group inclusive
        #[arg(long, conflicts_with = "exclude")]
        include: bool,

        /// Negate the group
        #[arg(long)]
        exclude: bool,
    },

    /// Edit a criterion
    Leaf {
        /// The criterion to edit
        id: NodeId,

        /// New display title
        #[arg(long, short)]
        title: Option<String>,

        /// Make the criterion inclusive
        #[arg(long, conflicts_with = "exclude")]
        include: bool,

        /// Negate the criterion
        #[arg(long)]
        exclude: bool,

        /// Set a criterion-specific field, as KEY=VALUE (repeatable)
        #[arg(long = "field", short, value_parser = parse_field)]
        fields: Vec<(String, serde_json::Value)>,

        /// Remove a criterion-specific field (repeatable)
        #[arg(long = "unset", value_name = "KEY")]
        unset: Vec<String>,

        /// Attach a validation message
        #[arg(long, conflicts_with = "clear_error")]
        error: Option<String>,

        /// Remove the validation message
        #[arg(long)]
        clear_error: bool,
    },
}

impl Command {
    #[instrument]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = workspace.load()?;

        match self.target {
            Target::Group {
                id,
                title,
                include,
                exclude,
            } => {
                let group = state.tree().group(id).ok_or_else(|| {
                    if state.tree().contains(id) {
                        TreeError::NotAGroup(id)
                    } else {
                        TreeError::NodeNotFound(id)
                    }
                })?;

                let mut patch = GroupPatch::from(group);
                if let Some(title) = title {
                    patch.title = title;
                }
                if let Some(is_inclusive) = inclusion(include, exclude) {
                    patch.is_inclusive = is_inclusive;
                }

                let next = state.edit_group(patch)?;
                save(&workspace, &next)?;
                println!("{}", format!("✅ Updated group {id}").success());
            }
            Target::Leaf {
                id,
                title,
                include,
                exclude,
                fields,
                unset,
                error,
                clear_error,
            } => {
                let current = state.tree().leaf(id).ok_or_else(|| {
                    if state.tree().contains(id) {
                        TreeError::NotALeaf(id)
                    } else {
                        TreeError::NodeNotFound(id)
                    }
                })?;

                let mut draft = LeafDraft::from(current.clone());
                if let Some(title) = title {
                    draft.title = title;
                }
                if let Some(is_inclusive) = inclusion(include, exclude) {
                    draft.is_inclusive = is_inclusive;
                }
                for key in &unset {
                    if draft.fields.remove(key).is_none() {
                        tracing::warn!("Criterion {id} has no field '{key}'");
                    }
                }
                draft.fields.extend(fields);
                if error.is_some() || clear_error {
                    draft.error = error;
                }

                let next = state.edit_leaf(Leaf::from_draft(id, draft))?;
                save(&workspace, &next)?;
                println!("{}", format!("✅ Updated criterion {id}").success());
            }
        }

        Ok(())
    }
}
