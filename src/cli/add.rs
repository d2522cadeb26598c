use std::path::PathBuf;

use cohort::{
    domain::{GroupDraft, GroupKind, LeafDraft, NodeId},
    Workspace,
};
use non_empty_string::NonEmptyString;
use tracing::instrument;

use crate::cli::{parse_criterion_kind, parse_field, save, terminal::Colorize};

#[derive(Debug, clap::Parser)]
pub struct Command {
    #[command(subcommand)]
    target: Target,
}

#[derive(Debug, clap::Subcommand)]
enum Target {
    /// Add a group
    ///
    /// Without --kind the group gets the configured sub-group default, which
    /// is normally the opposite of its parent (OR inside AND, AND inside
    /// anything else).
    #[command(allow_negative_numbers = true)]
    Group {
        /// The group to add to (0 is the root)
        parent: NodeId,

        /// The operator: and, or, at-least, at-most, exactly
        #[arg(long, short)]
        kind: Option<GroupKind>,

        /// Display title
        #[arg(long, short)]
        title: Option<String>,

        /// Negate the group
        #[arg(long)]
        exclude: bool,
    },

    /// Add a criterion
    #[command(allow_negative_numbers = true)]
    Leaf {
        /// The group to add to (0 is the root)
        parent: NodeId,

        /// The criterion kind, as named by the criterion catalog
        #[arg(value_parser = parse_criterion_kind)]
        kind: NonEmptyString,

        /// Display title
        #[arg(long, short)]
        title: Option<String>,

        /// Negate the criterion
        #[arg(long)]
        exclude: bool,

        /// Criterion-specific field, as KEY=VALUE (repeatable)
        #[arg(long = "field", short, value_parser = parse_field)]
        fields: Vec<(String, serde_json::Value)>,
    },
}

impl Command {
    #[instrument]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let workspace = Workspace::open(root);
        let state = workspace.load()?;

        match self.target {
            Target::Group {
                parent,
                kind,
                title,
                exclude,
            } => {
                let draft = GroupDraft {
                    title: title.unwrap_or_default(),
                    kind,
                    is_inclusive: !exclude,
                };
                let (next, id) = state.add_group(parent, draft)?;
                save(&workspace, &next)?;

                let kind = next
                    .tree()
                    .group(id)
                    .map(|group| group.group_type.kind().to_string())
                    .unwrap_or_default();
                println!(
                    "{}",
                    format!("✅ Added {kind} group {id} to {parent}").success()
                );
            }
            Target::Leaf {
                parent,
                kind,
                title,
                exclude,
                fields,
            } => {
                let mut draft = LeafDraft::new(kind);
                draft.title = title.unwrap_or_default();
                draft.is_inclusive = !exclude;
                draft.fields.extend(fields);

                let (next, id) = state.add_leaf(parent, draft)?;
                save(&workspace, &next)?;

                println!(
                    "{}",
                    format!("✅ Added criterion {id} to {parent}").success()
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use cohort::domain::GroupType;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::cli::Cli;

    fn setup() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        Workspace::init(root.clone()).unwrap();
        (tmp, root)
    }

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["cohort", "add"];
        argv.extend_from_slice(args);
        match Cli::parse_from(argv).command {
            Some(crate::cli::Command::Add(command)) => command,
            other => panic!("expected an add command, got {other:?}"),
        }
    }

    #[test]
    fn adds_leaf_with_fields() {
        let (_tmp, root) = setup();
        parse(&["leaf", "0", "Condition", "--title", "Asthma", "-f", "code=J45", "-f", "severity=2"])
            .run(root.clone())
            .unwrap();

        let state = Workspace::open(root).load().unwrap();
        let leaf = state.tree().leaf(NodeId::new(1)).unwrap();
        assert_eq!(leaf.kind.as_str(), "Condition");
        assert_eq!(leaf.title, "Asthma");
        assert!(leaf.is_inclusive);
        assert_eq!(leaf.fields.get("code"), Some(&json!("J45")));
        assert_eq!(leaf.fields.get("severity"), Some(&json!(2)));
    }

    #[test]
    fn adds_nested_groups_with_alternating_types() {
        let (_tmp, root) = setup();
        parse(&["group", "0"]).run(root.clone()).unwrap();
        parse(&["group", "-1", "--exclude"]).run(root.clone()).unwrap();

        let state = Workspace::open(root).load().unwrap();
        let outer = state.tree().group(NodeId::new(-1)).unwrap();
        let inner = state.tree().group(NodeId::new(-2)).unwrap();
        assert_eq!(outer.group_type, GroupType::Or);
        assert_eq!(inner.group_type, GroupType::And);
        assert!(inner.is_sub_group());
        assert!(!inner.is_inclusive);
    }

    #[test]
    fn explicit_kind_is_honoured() {
        let (_tmp, root) = setup();
        parse(&["group", "0", "--kind", "at-least"]).run(root.clone()).unwrap();

        let state = Workspace::open(root).load().unwrap();
        let group = state.tree().group(NodeId::new(-1)).unwrap();
        assert_eq!(group.group_type.kind(), GroupKind::AtLeast);
    }

    #[test]
    fn unknown_parent_fails_without_writing() {
        let (_tmp, root) = setup();
        let err = parse(&["leaf", "-7", "Condition"]).run(root.clone()).unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");

        let state = Workspace::open(root).load().unwrap();
        assert_eq!(state.tree().len(), 1);
        assert_eq!(state.ids().next_leaf_id(), NodeId::new(1));
    }
}
