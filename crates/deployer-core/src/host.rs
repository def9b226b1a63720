//! Capabilities the surrounding CI build provides.

use crate::composer::EnvBinding;
use crate::error::{DeployerError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Output of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Combined stdout and stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The build host: logging, command execution and binary lookup.
#[async_trait]
pub trait BuildHost: Send + Sync {
    /// Report a line to the build log.
    fn log(&self, message: &str);

    /// Run `command` through the shell with `env` added to its environment.
    async fn execute_command(&self, command: &str, env: &[EnvBinding]) -> Result<CommandOutput>;

    /// Locate an executable by name.
    fn find_binary(&self, name: &str) -> Option<PathBuf>;
}

/// [`BuildHost`] backed by the local machine.
#[derive(Debug, Clone, Default)]
pub struct LocalHost {
    working_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands from `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Abort commands that run longer than `secs` seconds (0 disables the limit).
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = (secs > 0).then_some(secs);
        self
    }
}

#[async_trait]
impl BuildHost for LocalHost {
    fn log(&self, message: &str) {
        info!("{}", message);
    }

    async fn execute_command(&self, command: &str, env: &[EnvBinding]) -> Result<CommandOutput> {
        debug!(command = %command, "Executing command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(env.iter().map(|b| (b.name.as_str(), b.value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| DeployerError::Execution(format!("failed to spawn '{}': {}", command, e)))?;

        let output = match self.timeout_secs {
            Some(secs) => tokio::time::timeout(
                std::time::Duration::from_secs(secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| DeployerError::Timeout(secs))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| DeployerError::Execution(e.to_string()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    fn find_binary(&self, name: &str) -> Option<PathBuf> {
        match &self.working_dir {
            // Project-local installs (e.g. vendor/bin/dep) win over PATH.
            Some(dir) => {
                let local = dir.join("vendor").join("bin").join(name);
                if local.is_file() {
                    return Some(local);
                }
                which::which(name).ok()
            }
            None => which::which(name).ok(),
        }
    }
}
