//! In-memory [`BuildHost`] for tests.

use crate::composer::EnvBinding;
use crate::error::{DeployerError, Result};
use crate::host::{BuildHost, CommandOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A command as seen by [`ScriptedHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command: String,
    pub env: Vec<EnvBinding>,
}

/// Build host that records everything and answers from a script.
///
/// Commands exit 0 unless a registered prefix matches; binaries resolve to
/// `/usr/bin/<name>` unless marked missing.
#[derive(Debug, Default)]
pub struct ScriptedHost {
    exit_codes: Mutex<Vec<(String, i32)>>,
    broken: Mutex<Vec<String>>,
    missing_binaries: Mutex<Vec<String>>,
    binaries: Mutex<HashMap<String, PathBuf>>,
    commands: Mutex<Vec<RecordedCommand>>,
    logs: Mutex<Vec<String>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` exit with `code`.
    pub fn exit_with(self, prefix: impl Into<String>, code: i32) -> Self {
        self.exit_codes.lock().unwrap().push((prefix.into(), code));
        self
    }

    /// Commands starting with `prefix` fail to execute at all.
    pub fn fail_to_spawn(self, prefix: impl Into<String>) -> Self {
        self.broken.lock().unwrap().push(prefix.into());
        self
    }

    /// Resolve `name` to `path`.
    pub fn with_binary(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.binaries
            .lock()
            .unwrap()
            .insert(name.into(), path.into());
        self
    }

    /// Make `name` unresolvable.
    pub fn without_binary(self, name: impl Into<String>) -> Self {
        self.missing_binaries.lock().unwrap().push(name.into());
        self
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildHost for ScriptedHost {
    fn log(&self, message: &str) {
        self.logs.lock().unwrap().push(message.to_string());
    }

    async fn execute_command(&self, command: &str, env: &[EnvBinding]) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(RecordedCommand {
            command: command.to_string(),
            env: env.to_vec(),
        });

        if self
            .broken
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()))
        {
            return Err(DeployerError::Execution(format!("cannot spawn '{}'", command)));
        }

        let exit_code = self
            .exit_codes
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);

        Ok(CommandOutput {
            exit_code,
            output: String::new(),
        })
    }

    fn find_binary(&self, name: &str) -> Option<PathBuf> {
        if self.missing_binaries.lock().unwrap().iter().any(|n| n == name) {
            return None;
        }
        let binaries = self.binaries.lock().unwrap();
        Some(
            binaries
                .get(name)
                .cloned()
                .unwrap_or_else(|| PathBuf::from("/usr/bin").join(name)),
        )
    }
}
