use std::path::PathBuf;

use cohort::{
    domain::{Config, SubgroupDefault},
    Workspace,
};
use tracing::instrument;

use super::terminal::Colorize;

#[derive(Debug, clap::Parser)]
pub struct Command {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Debug, clap::Parser)]
enum ConfigCommand {
    /// Show current configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key to set
        key: String,

        /// Value to set
        value: String,
    },
}

const fn subgroup_default_name(value: SubgroupDefault) -> &'static str {
    match value {
        SubgroupDefault::Opposite => "opposite",
        SubgroupDefault::And => "and",
        SubgroupDefault::Or => "or",
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    value
        .parse::<bool>()
        .map_err(|_| anyhow::anyhow!("Value must be 'true' or 'false'"))
}

/// Applies `key = value` to `config`, returning a confirmation message.
fn apply(config: &mut Config, key: &str, value: &str) -> anyhow::Result<String> {
    match key {
        "subgroup_default" => {
            config.subgroup_default = value.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            Ok(format!(
                "New sub-groups will be typed: {}",
                subgroup_default_name(config.subgroup_default)
            ))
        }
        "confirm_constraint_purge" => {
            config.confirm_constraint_purge = parse_bool(value)?;
            Ok(if config.confirm_constraint_purge {
                "Retyping an AND group will ask before dropping constraints".to_string()
            } else {
                "Retyping an AND group will drop constraints silently".to_string()
            })
        }
        "group_digits" => {
            config.group_digits = parse_bool(value)?;
            Ok(format!(
                "Counts will be shown as {}",
                if config.group_digits { "1,234" } else { "1234" }
            ))
        }
        _ => Err(anyhow::anyhow!(
            "Unknown configuration key: '{key}'\nSupported keys: subgroup_default, \
             confirm_constraint_purge, group_digits",
        )),
    }
}

impl Command {
    #[instrument]
    pub fn run(self, root: PathBuf) -> anyhow::Result<()> {
        let mut workspace = Workspace::open(root);

        match self.command {
            ConfigCommand::Show => {
                let config = workspace.config();
                println!("Configuration:");
                println!(
                    "  subgroup_default: {} ({})",
                    subgroup_default_name(config.subgroup_default),
                    match config.subgroup_default {
                        SubgroupDefault::Opposite => "OR below AND, AND elsewhere".dim(),
                        SubgroupDefault::And | SubgroupDefault::Or => "always".dim(),
                    }
                );
                println!(
                    "  confirm_constraint_purge: {}",
                    config.confirm_constraint_purge
                );
                println!("  group_digits: {}", config.group_digits);
            }
            ConfigCommand::Set { key, value } => {
                let mut config = workspace.config().clone();
                let message = apply(&mut config, &key, &value)?;
                workspace
                    .set_config(config)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                println!("{}", message.success());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cohort::domain::{GroupDraft, GroupType, NodeId};
    use tempfile::tempdir;
    use test_case::test_case;

    use super::*;

    fn set(key: &str, value: &str) -> Command {
        Command {
            command: ConfigCommand::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
        }
    }

    #[test_case("subgroup_default", "OR"; "sub-group default")]
    #[test_case("confirm_constraint_purge", "false"; "purge confirmation")]
    #[test_case("group_digits", "false"; "digit grouping")]
    fn known_keys_apply(key: &str, value: &str) {
        let mut config = Config::default();
        apply(&mut config, key, value).unwrap();
        assert_ne!(config, Config::default());
    }

    #[test_case("group_digits", "maybe"; "bad bool")]
    #[test_case("subgroup_default", "xor"; "bad sub-group default")]
    #[test_case("digits", "3"; "unknown key")]
    fn bad_settings_are_rejected(key: &str, value: &str) {
        let mut config = Config::default();
        assert!(apply(&mut config, key, value).is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn set_persists_and_applies_to_new_groups() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        Workspace::init(root.clone()).unwrap();

        set("subgroup_default", "and").run(root.clone()).unwrap();
        Command {
            command: ConfigCommand::Show,
        }
        .run(root.clone())
        .unwrap();

        let workspace = Workspace::open(root);
        assert_eq!(workspace.config().subgroup_default, SubgroupDefault::And);

        let state = workspace.load().unwrap();
        let (state, id) = state.add_group(NodeId::ROOT, GroupDraft::new()).unwrap();
        assert_eq!(state.tree().group(id).unwrap().group_type, GroupType::And);
    }
}
