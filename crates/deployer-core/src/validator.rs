//! Decides whether the branch under build should be deployed.

use crate::config::{BranchConfig, DeploymentConfig};
use serde::{Deserialize, Serialize};

/// Why validation stopped before composing a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// No configuration at all.
    ConfigAbsent,

    /// The branch has no entry; it is simply not deployed.
    NoBranchEntry,

    /// The branch entry has no stage to deploy to.
    MissingStage,
}

impl TerminalReason {
    /// Log line reported to the build.
    pub fn message(&self) -> &'static str {
        match self {
            TerminalReason::ConfigAbsent => "Can't find configuration for plugin!",
            TerminalReason::NoBranchEntry => "There is no specified config for this branch.",
            TerminalReason::MissingStage => "There is no stage for this branch",
        }
    }

    /// Whether the build step counts as successful.
    pub fn success(&self) -> bool {
        matches!(self, TerminalReason::NoBranchEntry)
    }
}

/// Validation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed(BranchConfig),
    Terminal(TerminalReason),
}

impl Verdict {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Verdict::Proceed(_))
    }
}

/// Config validation rules.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate `config` for `branch`.
    ///
    /// Rules, first match wins:
    /// - empty config: terminal failure
    /// - no entry for the branch, or an entry that sets nothing: terminal
    ///   success (nothing to deploy)
    /// - entry without a stage: terminal failure
    /// - otherwise proceed with a copy of the branch entry
    pub fn validate(config: &DeploymentConfig, branch: &str) -> Verdict {
        if config.is_empty() {
            return Verdict::Terminal(TerminalReason::ConfigAbsent);
        }

        let Some(branch_config) = config.branch(branch).filter(|c| !c.is_empty()) else {
            return Verdict::Terminal(TerminalReason::NoBranchEntry);
        };

        if branch_config.stage().is_none() {
            return Verdict::Terminal(TerminalReason::MissingStage);
        }

        Verdict::Proceed(branch_config.clone())
    }
}
