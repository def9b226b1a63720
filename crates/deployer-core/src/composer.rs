//! Command composition: branch config in, ordered command plan out.

use crate::config::{BranchConfig, ProvisionKey};
use crate::credentials::{CredentialWriter, SshKeyPaths};
use crate::error::ComposeError;
use crate::verbosity::Verbosity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Env var holding the generated private key path.
pub const SSH_PRIVATE_KEY_ENV: &str = "DEPLOYER_SSH_PRIVATE_KEY";

/// Env var holding the generated public key path.
pub const SSH_PUBLIC_KEY_ENV: &str = "DEPLOYER_SSH_PUBLIC_KEY";

/// A single environment variable exported to the deploy command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvBinding {
    pub name: String,
    pub value: String,
}

impl EnvBinding {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One step of a [`CommandPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    /// Export bindings for every following command.
    ExportEnv(Vec<EnvBinding>),

    /// The `dep` invocation.
    Deploy(String),

    /// Remove key files written for this plan.
    RemoveKeys { command: String, keys: SshKeyPaths },
}

impl PlanStep {
    /// Step name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            PlanStep::ExportEnv(_) => "export_env",
            PlanStep::Deploy(_) => "deploy",
            PlanStep::RemoveKeys { .. } => "remove_keys",
        }
    }

    /// Shell command run by this step, if it runs one.
    pub fn command(&self) -> Option<&str> {
        match self {
            PlanStep::ExportEnv(_) => None,
            PlanStep::Deploy(command) | PlanStep::RemoveKeys { command, .. } => {
                Some(command.as_str())
            }
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStep::ExportEnv(bindings) => {
                write!(f, "export")?;
                for binding in bindings {
                    write!(f, " {}={}", binding.name, quote_lossy(&binding.value))?;
                }
                Ok(())
            }
            PlanStep::Deploy(command) | PlanStep::RemoveKeys { command, .. } => {
                f.write_str(command)
            }
        }
    }
}

/// Ordered steps for one deploy: `[export env] -> deploy -> [remove keys]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    steps: Vec<PlanStep>,
}

impl CommandPlan {
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The `dep` command line.
    pub fn deploy_command(&self) -> &str {
        self.steps
            .iter()
            .find_map(|step| match step {
                PlanStep::Deploy(command) => Some(command.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Environment exported before the deploy command.
    pub fn env(&self) -> &[EnvBinding] {
        self.steps
            .iter()
            .find_map(|step| match step {
                PlanStep::ExportEnv(bindings) => Some(bindings.as_slice()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Key removal command, present iff keys were provisioned.
    pub fn cleanup_command(&self) -> Option<&str> {
        self.provisioned().map(|(command, _)| command)
    }

    /// Key files written for this plan.
    pub fn provisioned_keys(&self) -> Option<&SshKeyPaths> {
        self.provisioned().map(|(_, keys)| keys)
    }

    fn provisioned(&self) -> Option<(&str, &SshKeyPaths)> {
        self.steps.iter().find_map(|step| match step {
            PlanStep::RemoveKeys { command, keys } => Some((command.as_str(), keys)),
            _ => None,
        })
    }
}

impl fmt::Display for CommandPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

/// Builds `dep` command plans for a located binary.
#[derive(Debug, Clone)]
pub struct CommandComposer {
    binary: PathBuf,
}

impl CommandComposer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Compose the deploy command line:
    /// `<dep> [--filename=<value>] [-<flag>] <task> <stage>`.
    pub fn deploy_command(&self, config: &BranchConfig) -> Result<String, ComposeError> {
        let stage = config.stage().ok_or(ComposeError::MissingStage)?;
        let verbosity = Verbosity::resolve(config.verbosity.as_deref())?;

        let mut parts = vec![quote(&self.binary.to_string_lossy())?];

        if let Some(filename) = config
            .filename_override
            .as_deref()
            .filter(|f| !f.is_empty())
        {
            parts.push(format!("--filename={}", quote(filename)?));
        }
        if let Some(flag) = verbosity.flag() {
            parts.push(format!("-{}", flag));
        }
        parts.push(quote(config.task())?);
        parts.push(quote(stage)?);

        Ok(parts.join(" "))
    }

    /// Compose the full plan, writing key files through `writer` when the
    /// branch asks for them.
    ///
    /// The command line is resolved before any key is written, so a
    /// composition error never leaves key files behind.
    pub fn compose(
        &self,
        config: &BranchConfig,
        writer: &dyn CredentialWriter,
    ) -> Result<CommandPlan, ComposeError> {
        let deploy = self.deploy_command(config)?;

        let mut steps = Vec::with_capacity(3);
        let provisioned = match config.provision_key.as_ref().filter(|k| k.is_active()) {
            None => None,
            Some(ProvisionKey::Enabled(_)) => {
                let keys = writer.write_default()?;
                steps.push(PlanStep::ExportEnv(vec![
                    EnvBinding::new(SSH_PRIVATE_KEY_ENV, keys.private_key.to_string_lossy()),
                    EnvBinding::new(SSH_PUBLIC_KEY_ENV, keys.public_key.to_string_lossy()),
                ]));
                Some(keys)
            }
            Some(ProvisionKey::Path(path)) => Some(writer.write_at(path)?),
        };

        steps.push(PlanStep::Deploy(deploy));

        if let Some(keys) = provisioned {
            let command = format!(
                "rm -f {} {}",
                quote(&keys.private_key.to_string_lossy())?,
                quote(&keys.public_key.to_string_lossy())?
            );
            steps.push(PlanStep::RemoveKeys { command, keys });
        }

        debug!(steps = steps.len(), "Composed command plan");
        Ok(CommandPlan { steps })
    }
}

fn quote(arg: &str) -> Result<String, ComposeError> {
    shlex::try_quote(arg)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| ComposeError::UnquotableArgument(arg.to_string()))
}

fn quote_lossy(arg: &str) -> String {
    quote(arg).unwrap_or_else(|_| arg.to_string())
}
