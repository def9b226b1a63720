//! Deployer verbosity levels.

use crate::error::ComposeError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Output verbosity passed to `dep`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// No flag
    #[default]
    Normal,

    /// -v
    Verbose,

    /// -vv
    VeryVerbose,

    /// -vvv
    Debug,

    /// -q
    Quiet,
}

impl Verbosity {
    /// Flag body without the leading dash, `None` for normal output.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            Verbosity::Normal => None,
            Verbosity::Verbose => Some("v"),
            Verbosity::VeryVerbose => Some("vv"),
            Verbosity::Debug => Some("vvv"),
            Verbosity::Quiet => Some("q"),
        }
    }

    /// Resolve an optional config value; absent or blank means normal.
    pub fn resolve(value: Option<&str>) -> Result<Self, ComposeError> {
        match value {
            Some(v) if !v.trim().is_empty() => v.parse(),
            _ => Ok(Verbosity::Normal),
        }
    }
}

impl FromStr for Verbosity {
    type Err = ComposeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(Verbosity::Normal),
            "verbose" => Ok(Verbosity::Verbose),
            "very verbose" => Ok(Verbosity::VeryVerbose),
            "debug" => Ok(Verbosity::Debug),
            "quiet" => Ok(Verbosity::Quiet),
            _ => Err(ComposeError::UnknownVerbosity(s.to_string())),
        }
    }
}
