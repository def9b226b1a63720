//! Error types for config loading, composition and execution

use std::path::PathBuf;
use thiserror::Error;

/// Failure while turning a branch config into a command plan.
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Unknown verbosity level '{0}' (expected normal, verbose, very verbose, debug or quiet)")]
    UnknownVerbosity(String),

    #[error("There is no stage for this branch")]
    MissingStage,

    #[error("Argument cannot be passed through the shell: {0:?}")]
    UnquotableArgument(String),

    #[error("Credential provisioning failed: {0}")]
    Credentials(#[from] CredentialError),
}

/// Failure while writing SSH key material to disk.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("No stored SSH keypair available for this build")]
    NoStoredKeys,

    #[error("Failed to write key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum DeployerError {
    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("Could not locate the '{0}' binary")]
    BinaryNotFound(String),

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    ConfigParse(String),

    #[error("Command could not be executed: {0}")]
    Execution(String),

    #[error("Command timed out after {0} seconds")]
    Timeout(u64),
}

impl From<serde_yaml::Error> for DeployerError {
    fn from(e: serde_yaml::Error) -> Self {
        DeployerError::ConfigParse(e.to_string())
    }
}

impl From<serde_json::Error> for DeployerError {
    fn from(e: serde_json::Error) -> Self {
        DeployerError::ConfigParse(e.to_string())
    }
}

/// Result type for deployer operations
pub type Result<T> = std::result::Result<T, DeployerError>;
