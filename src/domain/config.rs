use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::GroupType;

/// Configuration for editing a cohort.
///
/// This struct holds settings that control how new groups are typed, when
/// the user is asked before temporal constraints are dropped, and how
/// population counts are displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Versions", into = "Versions")]
pub struct Config {
    /// The type given to a new sub-group when the user does not pick one.
    pub subgroup_default: SubgroupDefault,

    /// Whether changing an AND group to another type asks for confirmation
    /// before dropping the temporal constraints attached to it.
    ///
    /// When `false` the constraints are dropped silently.
    pub confirm_constraint_purge: bool,

    /// Whether population counts are displayed with thousands separators.
    pub group_digits: bool,
}

/// How the type of a new sub-group is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubgroupDefault {
    /// The opposite of the parent's type: OR below AND, AND below anything
    /// else.
    #[default]
    Opposite,
    /// Always AND.
    And,
    /// Always OR.
    Or,
}

impl SubgroupDefault {
    /// The type for a new child of a group of type `parent`.
    #[must_use]
    pub const fn for_parent(self, parent: &GroupType) -> GroupType {
        match self {
            Self::Opposite => parent.opposite(),
            Self::And => GroupType::And,
            Self::Or => GroupType::Or,
        }
    }
}

impl std::str::FromStr for SubgroupDefault {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opposite" => Ok(Self::Opposite),
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(format!(
                "unknown sub-group default '{other}': expected opposite, and, or"
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subgroup_default: SubgroupDefault::default(),
            confirm_constraint_purge: default_true(),
            group_digits: default_true(),
        }
    }
}

/// Errors raised while reading or writing the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    /// The file is not valid configuration TOML.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration could not be encoded.
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// The file could not be written.
    #[error("Failed to write config file: {0}")]
    Write(#[source] std::io::Error),
}

impl Config {
    /// Loads the configuration from a TOML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or if the TOML content is
    /// invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Ok(toml::from_str(&content)?)
    }

    /// Saves the configuration to a TOML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized to TOML or if
    /// the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(ConfigError::Write)
    }
}

const fn default_true() -> bool {
    true
}

/// The serialized versions of the configuration.
/// This allows for future changes to the configuration format and to the domain
/// type without breaking compatibility.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_version")]
enum Versions {
    #[serde(rename = "1")]
    V1 {
        #[serde(default)]
        subgroup_default: SubgroupDefault,

        #[serde(default = "default_true")]
        confirm_constraint_purge: bool,

        #[serde(default = "default_true")]
        group_digits: bool,
    },
}

impl From<Versions> for Config {
    fn from(versions: Versions) -> Self {
        match versions {
            Versions::V1 {
                subgroup_default,
                confirm_constraint_purge,
                group_digits,
            } => Self {
                subgroup_default,
                confirm_constraint_purge,
                group_digits,
            },
        }
    }
}

impl From<Config> for Versions {
    fn from(config: Config) -> Self {
        Self::V1 {
            subgroup_default: config.subgroup_default,
            confirm_constraint_purge: config.confirm_constraint_purge,
            group_digits: config.group_digits,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_reads_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"_version = \"1\"\nsubgroup_default = \"or\"\nconfirm_constraint_purge = false\ngroup_digits = false\n",
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.subgroup_default, SubgroupDefault::Or);
        assert!(!config.confirm_constraint_purge);
        assert!(!config.group_digits);
    }

    #[test]
    fn load_missing_file_returns_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing.toml");

        let error = Config::load(&missing).unwrap_err();
        assert!(error.to_string().starts_with("Failed to read config file:"));
    }

    #[test]
    fn load_invalid_toml_returns_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"_version = \"1\"\nsubgroup_default = \"xor\"\n")
            .unwrap();

        let error = Config::load(file.path()).unwrap_err();
        assert!(error.to_string().starts_with("Failed to parse config file:"));
    }

    #[test]
    fn empty_file_returns_default() {
        // Tests that deserialising an empty file returns the default configuration.
        let expected = Config::default();
        let actual: Config = toml::from_str(r#"_version = "1""#).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let config = Config {
            subgroup_default: SubgroupDefault::And,
            ..Config::default()
        };

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn opposite_follows_parent() {
        assert_eq!(
            SubgroupDefault::Opposite.for_parent(&GroupType::And),
            GroupType::Or
        );
        assert_eq!(SubgroupDefault::Or.for_parent(&GroupType::Or), GroupType::Or);
    }
}
