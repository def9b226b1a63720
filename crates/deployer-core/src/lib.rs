//! Deployer CI step
//!
//! Turns a branch-keyed deployment config into a single `dep` invocation:
//! - Validates the config against the branch being built
//! - Composes the command line (task, stage, verbosity, filename override)
//! - Provisions SSH key files for the deploy and removes them afterwards
//! - Executes the plan through a host-provided command executor

pub mod composer;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod host;
pub mod runner;
pub mod telemetry;
pub mod validator;
pub mod verbosity;

// Re-export key types
pub use composer::{
    CommandComposer, CommandPlan, EnvBinding, PlanStep, SSH_PRIVATE_KEY_ENV, SSH_PUBLIC_KEY_ENV,
};
pub use config::{BranchConfig, DeploymentConfig, ProvisionKey};
pub use credentials::{
    CredentialWriter, FsCredentialWriter, KeyMaterial, PreviewCredentialWriter, SshKeyPaths,
};
pub use error::{ComposeError, CredentialError, DeployerError, Result};
pub use executor::{CleanupPolicy, ExecutionReport, PlanExecutor, StepResult, StepStatus};
pub use host::{BuildHost, CommandOutput, LocalHost};
pub use runner::{DeployOutcome, DeploySettings, Deployer};
pub use telemetry::init_tracing;
pub use validator::{ConfigValidator, TerminalReason, Verdict};
pub use verbosity::Verbosity;

/// Deployer CI version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
