//! Branch-keyed deployment configuration.

use crate::error::{DeployerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Deployment configuration keyed by branch name.
///
/// Supplied per build and never mutated; validator and composer only borrow it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DeploymentConfig {
    #[serde(deserialize_with = "deserialize_branches")]
    branches: BTreeMap<String, BranchConfig>,
}

/// Branch map where a null entry (`develop:` with nothing under it) reads as an
/// empty [`BranchConfig`].
fn deserialize_branches<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, BranchConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, Option<BranchConfig>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(branch, config)| (branch, config.unwrap_or_default()))
        .collect())
}

impl DeploymentConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry for `branch`.
    pub fn with_branch(mut self, branch: impl Into<String>, config: BranchConfig) -> Self {
        self.branches.insert(branch.into(), config);
        self
    }

    /// Whether no branch has an entry.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Entry for `branch`, if any.
    pub fn branch(&self, branch: &str) -> Option<&BranchConfig> {
        self.branches.get(branch)
    }

    /// Configured branch names, sorted.
    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.branches.keys().map(String::as_str)
    }

    /// Load a config file. `.json` files are parsed as JSON, everything else as YAML.
    ///
    /// `section` selects a top-level key holding the branch map, e.g. the plugin
    /// block of a build file that carries other settings too.
    pub fn load(path: &Path, section: Option<&str>) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| DeployerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        debug!(path = %path.display(), json = is_json, "Loading deployment config");

        if is_json {
            Self::from_json_str(&raw, section)
        } else {
            Self::from_yaml_str(&raw, section)
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(raw: &str, section: Option<&str>) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_yaml::from_str(raw)?;
        Self::from_value(value, section)
    }

    /// Parse a JSON document.
    pub fn from_json_str(raw: &str, section: Option<&str>) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value, section)
    }

    fn from_value(value: Value, section: Option<&str>) -> Result<Self> {
        let value = match section {
            Some(key) => match value {
                Value::Object(mut map) => map.remove(key).unwrap_or(Value::Null),
                Value::Null => Value::Null,
                _ => {
                    return Err(DeployerError::ConfigParse(format!(
                        "cannot select section '{}' from a non-mapping document",
                        key
                    )))
                }
            },
            None => value,
        };

        // An empty document or missing section means "no configuration".
        if value.is_null() {
            return Ok(Self::default());
        }

        Ok(serde_json::from_value(value)?)
    }
}

/// Deploy settings for one branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BranchConfig {
    /// Deployer task, `deploy` when absent or empty.
    pub task: Option<String>,

    /// Target stage. Required.
    pub stage: Option<String>,

    /// One of normal, verbose, very verbose, debug, quiet.
    pub verbosity: Option<String>,

    /// Value for `--filename=`.
    #[serde(
        rename = "filename",
        alias = "filename_override",
        alias = "filenameOverride",
        skip_serializing_if = "Option::is_none"
    )]
    pub filename_override: Option<String>,

    /// SSH key provisioning mode.
    #[serde(
        alias = "provisionKey",
        alias = "ssh_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub provision_key: Option<ProvisionKey>,
}

impl BranchConfig {
    /// Config deploying to `stage` with every other field left at its default.
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_verbosity(mut self, verbosity: impl Into<String>) -> Self {
        self.verbosity = Some(verbosity.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename_override = Some(filename.into());
        self
    }

    pub fn with_provision_key(mut self, key: ProvisionKey) -> Self {
        self.provision_key = Some(key);
        self
    }

    /// Stage name, `None` when absent or blank.
    pub fn stage(&self) -> Option<&str> {
        non_blank(self.stage.as_deref())
    }

    /// Task name with the `deploy` default applied.
    pub fn task(&self) -> &str {
        non_blank(self.task.as_deref()).unwrap_or(DEFAULT_TASK)
    }

    /// Whether the entry sets nothing at all (`develop:` or `develop: {}`).
    pub fn is_empty(&self) -> bool {
        self.task.is_none()
            && self.stage.is_none()
            && self.verbosity.is_none()
            && self.filename_override.is_none()
            && self.provision_key.is_none()
    }
}

/// Task run when a branch does not name one.
pub const DEFAULT_TASK: &str = "deploy";

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// How the build's stored SSH keypair is handed to `dep`.
///
/// `true` writes the keys to generated paths and exports them through the
/// environment; a string writes them to that path (and `<path>.pub`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProvisionKey {
    Enabled(bool),
    Path(PathBuf),
}

impl ProvisionKey {
    /// Whether any key files will be written.
    pub fn is_active(&self) -> bool {
        match self {
            ProvisionKey::Enabled(enabled) => *enabled,
            ProvisionKey::Path(path) => !path.as_os_str().is_empty(),
        }
    }
}
