//! Configuration surface of the engine.
//!
//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the engine. Validation is strict by
//! intent: every fatal misconfiguration surfaces here, at startup, before any
//! record is accepted.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors produced by [`Config`] validation and loading.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading a config file.
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// Per-tag output routing needs a prefix to build output tags from.
    #[error("add_tag_prefix must be specified with output_per_tag")]
    OutputPerTagRequiresPrefix,
    /// Group-by field list and expression are mutually exclusive.
    #[error("group_by_keys and group_by_expression cannot both be set")]
    ConflictingGroupBy,
    /// The flush interval must be positive.
    #[error("count_interval must be greater than zero")]
    ZeroInterval,
    /// Group-key compilation failed (bad template or rewrite pattern).
    #[error(transparent)]
    GroupKey(#[from] crate::group_key::ParseError),
    /// The snapshot file location cannot be written.
    #[error("store_file {path:?} is not writable: {source}")]
    StoreFileNotWritable {
        /// Configured path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
}

/// How scopes are chosen for incoming records.
#[derive(Debug, Copy, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    /// Each routing tag is its own scope.
    #[default]
    Tag,
    /// All tags collapse into the single sentinel scope `all`.
    All,
}

/// Interval shorthand used when `count_interval` is not given explicitly.
#[derive(Debug, Copy, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Sixty seconds.
    #[default]
    Minute,
    /// Thirty-six hundred seconds.
    Hour,
    /// A day of eighty-six thousand four hundred seconds.
    Day,
}

impl Unit {
    fn seconds(self) -> u64 {
        match self {
            Unit::Minute => 60,
            Unit::Hour => 3_600,
            Unit::Day => 86_400,
        }
    }
}

fn default_tag() -> String {
    String::from("groupcount")
}

fn default_delimiter() -> String {
    String::from("_")
}

fn default_count_suffix() -> String {
    String::from("_count")
}

fn default_max_suffix() -> String {
    String::from("_max")
}

fn default_min_suffix() -> String {
    String::from("_min")
}

fn default_avg_suffix() -> String {
    String::from("_avg")
}

/// Configuration of the aggregation engine.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Flush interval in seconds. Defaults to the value of `unit`.
    pub count_interval: Option<u64>,
    /// Interval shorthand used when `count_interval` is absent.
    #[serde(default)]
    pub unit: Unit,
    /// Scope selection: per routing tag, or everything into `all`.
    #[serde(default)]
    pub aggregate: Aggregate,
    /// Emit one record per scope instead of a single merged record.
    #[serde(default)]
    pub output_per_tag: bool,
    /// Output tag for the single merged record.
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Prefix prepended to per-scope output tags.
    pub add_tag_prefix: Option<String>,
    /// Prefix stripped from scope tags before they appear in output.
    pub remove_tag_prefix: Option<String>,
    /// Ordered record fields joined into the group key.
    pub group_by_keys: Option<Vec<String>>,
    /// `${...}` template deriving the group key.
    pub group_by_expression: Option<String>,
    /// Record field tracked as a per-group maximum.
    pub max_key: Option<String>,
    /// Record field tracked as a per-group minimum.
    pub min_key: Option<String>,
    /// Record field tracked as a per-group average.
    pub avg_key: Option<String>,
    /// Joins group-key parts and output field name components.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Suffix of emitted count fields.
    #[serde(default = "default_count_suffix")]
    pub count_suffix: String,
    /// Suffix of emitted max fields.
    #[serde(default = "default_max_suffix")]
    pub max_suffix: String,
    /// Suffix of emitted min fields.
    #[serde(default = "default_min_suffix")]
    pub min_suffix: String,
    /// Suffix of emitted average fields.
    #[serde(default = "default_avg_suffix")]
    pub avg_suffix: String,
    /// Ordered `"REPLACEMENT REGEX"` rewrite patterns, at most twenty.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Where to persist a snapshot across restarts. No persistence if unset.
    pub store_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            count_interval: None,
            unit: Unit::default(),
            aggregate: Aggregate::default(),
            output_per_tag: false,
            tag: default_tag(),
            add_tag_prefix: None,
            remove_tag_prefix: None,
            group_by_keys: None,
            group_by_expression: None,
            max_key: None,
            min_key: None,
            avg_key: None,
            delimiter: default_delimiter(),
            count_suffix: default_count_suffix(),
            max_suffix: default_max_suffix(),
            min_suffix: default_min_suffix(),
            avg_suffix: default_avg_suffix(),
            patterns: Vec::new(),
            store_file: None,
        }
    }
}

impl Config {
    /// Validate the cross-field constraints that serde cannot express.
    ///
    /// Group-key template and pattern compilation happens separately when the
    /// engine is built; this covers everything else that must abort startup.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero interval, per-tag routing without
    /// `add_tag_prefix`, both group-by modes at once, or an unwritable
    /// `store_file` location.
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval() == 0 {
            return Err(Error::ZeroInterval);
        }
        if self.output_per_tag && self.add_tag_prefix.is_none() {
            return Err(Error::OutputPerTagRequiresPrefix);
        }
        if self.group_by_keys.is_some() && self.group_by_expression.is_some() {
            return Err(Error::ConflictingGroupBy);
        }
        if let Some(path) = &self.store_file {
            check_writable(path).map_err(|source| Error::StoreFileNotWritable {
                path: path.clone(),
                source: Box::new(source),
            })?;
        }
        Ok(())
    }

    /// The effective flush interval in seconds.
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.count_interval.unwrap_or_else(|| self.unit.seconds())
    }
}

/// Probe that `path` either exists writable or can be created.
fn check_writable(path: &Path) -> Result<(), std::io::Error> {
    let existed = path.exists();
    fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    if !existed {
        // The probe created an empty file; leave no trace behind.
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Deserialize a [`Config`] from YAML text.
///
/// # Errors
///
/// Returns an error if the YAML fails to parse or validation fails.
pub fn load_config_from_str(contents: &str) -> Result<Config, Error> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Deserialize a [`Config`] from a YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML fails to parse or
/// validation fails.
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    load_config_from_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes() -> Result<(), Error> {
        let contents = r"
count_interval: 30
aggregate: all
group_by_keys: [code, method, path]
avg_key: reqtime
patterns:
  - 'PING ^/ping$'
";
        let config = load_config_from_str(contents)?;
        assert_eq!(config.count_interval, Some(30));
        assert_eq!(config.interval(), 30);
        assert_eq!(config.aggregate, Aggregate::All);
        assert_eq!(
            config.group_by_keys,
            Some(vec![
                String::from("code"),
                String::from("method"),
                String::from("path")
            ])
        );
        assert_eq!(config.avg_key.as_deref(), Some("reqtime"));
        assert_eq!(config.patterns.len(), 1);
        assert_eq!(config.tag, "groupcount");
        assert_eq!(config.delimiter, "_");
        Ok(())
    }

    #[test]
    fn unit_supplies_interval_default() -> Result<(), Error> {
        let config = load_config_from_str("unit: hour")?;
        assert_eq!(config.interval(), 3_600);
        let config = load_config_from_str("{}")?;
        assert_eq!(config.interval(), 60);
        Ok(())
    }

    #[test]
    fn unknown_unit_rejected() {
        let result = load_config_from_str("unit: fortnight");
        assert!(matches!(result, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn unknown_aggregate_rejected() {
        let result = load_config_from_str("aggregate: some");
        assert!(matches!(result, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn unknown_field_rejected() {
        let result = load_config_from_str("no_such_option: 1");
        assert!(matches!(result, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn output_per_tag_requires_prefix() {
        let result = load_config_from_str("output_per_tag: true");
        assert!(matches!(result, Err(Error::OutputPerTagRequiresPrefix)));

        let result = load_config_from_str(
            "output_per_tag: true\nadd_tag_prefix: summary",
        );
        assert!(result.is_ok());
    }

    #[test]
    fn conflicting_group_by_rejected() {
        let result = load_config_from_str(
            "group_by_keys: [code]\ngroup_by_expression: '${tag}'",
        );
        assert!(matches!(result, Err(Error::ConflictingGroupBy)));
    }

    #[test]
    fn zero_interval_rejected() {
        let result = load_config_from_str("count_interval: 0");
        assert!(matches!(result, Err(Error::ZeroInterval)));
    }

    #[test]
    fn unwritable_store_file_rejected() {
        let config = Config {
            store_file: Some(PathBuf::from("/nonexistent-dir/state.json")),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::StoreFileNotWritable { .. })
        ));
    }

    #[test]
    fn writable_store_file_leaves_no_probe_behind() -> Result<(), Error> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let config = Config {
            store_file: Some(path.clone()),
            ..Default::default()
        };
        config.validate()?;
        assert!(!path.exists());
        Ok(())
    }
}
