//! Entry point tying validation, composition and execution together.

use crate::composer::{CommandComposer, CommandPlan};
use crate::config::DeploymentConfig;
use crate::credentials::CredentialWriter;
use crate::error::{DeployerError, Result};
use crate::executor::{CleanupPolicy, ExecutionReport, PlanExecutor};
use crate::host::BuildHost;
use crate::validator::{ConfigValidator, TerminalReason, Verdict};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the Deployer executable.
pub const DEFAULT_BINARY: &str = "dep";

/// Settings for one [`Deployer`].
#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// Executable looked up through the host.
    pub binary_name: String,

    /// Explicit executable path; skips the lookup.
    pub binary_path: Option<PathBuf>,

    pub cleanup_policy: CleanupPolicy,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            binary_name: DEFAULT_BINARY.to_string(),
            binary_path: None,
            cleanup_policy: CleanupPolicy::default(),
        }
    }
}

impl DeploySettings {
    pub fn with_binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup_policy = policy;
        self
    }
}

/// How a deploy run ended.
#[derive(Debug, Clone)]
pub enum DeployOutcome {
    /// Validation stopped the run before anything was composed.
    Terminal(TerminalReason),

    /// The branch config could not be turned into a plan.
    ComposeFailed(String),

    /// The plan ran.
    Executed(ExecutionReport),
}

impl DeployOutcome {
    /// Overall success reported back to the build.
    pub fn success(&self) -> bool {
        match self {
            DeployOutcome::Terminal(reason) => reason.success(),
            DeployOutcome::ComposeFailed(_) => false,
            DeployOutcome::Executed(report) => report.success,
        }
    }
}

/// Deploy step for one build.
pub struct Deployer {
    host: Arc<dyn BuildHost>,
    writer: Arc<dyn CredentialWriter>,
    composer: CommandComposer,
    cleanup_policy: CleanupPolicy,
}

impl Deployer {
    /// Locate the `dep` binary and set up the deployer.
    pub fn new(
        host: Arc<dyn BuildHost>,
        writer: Arc<dyn CredentialWriter>,
        settings: DeploySettings,
    ) -> Result<Self> {
        let binary = match settings.binary_path {
            Some(path) => path,
            None => host
                .find_binary(&settings.binary_name)
                .ok_or_else(|| DeployerError::BinaryNotFound(settings.binary_name.clone()))?,
        };
        info!(binary = %binary.display(), "Using Deployer binary");

        Ok(Self {
            host,
            writer,
            composer: CommandComposer::new(binary),
            cleanup_policy: settings.cleanup_policy,
        })
    }

    pub fn composer(&self) -> &CommandComposer {
        &self.composer
    }

    /// Validate and compose without executing anything.
    ///
    /// Key files are written through the configured writer, so use a preview
    /// writer when only the plan is wanted. Terminal verdicts and compose
    /// errors are logged to the host and returned as the outcome.
    pub fn prepare(
        &self,
        config: &DeploymentConfig,
        branch: &str,
    ) -> std::result::Result<CommandPlan, DeployOutcome> {
        let branch_config = match ConfigValidator::validate(config, branch) {
            Verdict::Proceed(branch_config) => branch_config,
            Verdict::Terminal(reason) => {
                info!(branch = %branch, reason = ?reason, "Not deploying");
                self.host.log(reason.message());
                return Err(DeployOutcome::Terminal(reason));
            }
        };

        match self.composer.compose(&branch_config, self.writer.as_ref()) {
            Ok(plan) => {
                info!(
                    branch = %branch,
                    stage = branch_config.stage().unwrap_or_default(),
                    steps = plan.len(),
                    "Deploy planned"
                );
                Ok(plan)
            }
            Err(e) => {
                warn!(branch = %branch, error = %e, "Could not compose deploy command");
                self.host.log(&e.to_string());
                Err(DeployOutcome::ComposeFailed(e.to_string()))
            }
        }
    }

    /// Run the deploy step and report the full outcome.
    pub async fn run_detailed(&self, config: &DeploymentConfig, branch: &str) -> DeployOutcome {
        let plan = match self.prepare(config, branch) {
            Ok(plan) => plan,
            Err(outcome) => return outcome,
        };

        let report = PlanExecutor::execute(self.host.as_ref(), &plan, self.cleanup_policy).await;
        if report.success {
            info!(branch = %branch, duration_ms = report.duration_ms, "Deploy succeeded");
        } else {
            warn!(branch = %branch, duration_ms = report.duration_ms, "Deploy failed");
        }
        DeployOutcome::Executed(report)
    }

    /// Run the deploy step; `true` when the build step succeeded.
    pub async fn run(&self, config: &DeploymentConfig, branch: &str) -> bool {
        self.run_detailed(config, branch).await.success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::{SSH_PRIVATE_KEY_ENV, SSH_PUBLIC_KEY_ENV};
    use crate::config::{BranchConfig, ProvisionKey};
    use crate::credentials::{FsCredentialWriter, KeyMaterial};
    use crate::executor::StepStatus;
    use crate::fakes::ScriptedHost;

    fn deployer(host: Arc<ScriptedHost>, key_dir: &std::path::Path) -> Deployer {
        deployer_with(host, key_dir, DeploySettings::default())
    }

    fn deployer_with(
        host: Arc<ScriptedHost>,
        key_dir: &std::path::Path,
        settings: DeploySettings,
    ) -> Deployer {
        let writer = FsCredentialWriter::new(
            Some(KeyMaterial::new("private", "public")),
            key_dir,
            "101",
        );
        Deployer::new(host, Arc::new(writer), settings).expect("deployer")
    }

    fn main_config(branch: BranchConfig) -> DeploymentConfig {
        DeploymentConfig::new().with_branch("main", branch)
    }

    #[test]
    fn test_missing_binary() {
        let host = Arc::new(ScriptedHost::new().without_binary("dep"));
        let writer = FsCredentialWriter::new(None, std::env::temp_dir(), "1");
        let err = Deployer::new(host, Arc::new(writer), DeploySettings::default())
            .err()
            .expect("should fail");
        assert!(matches!(err, DeployerError::BinaryNotFound(ref n) if n == "dep"));
    }

    #[test]
    fn test_explicit_binary_path_skips_lookup() {
        let host = Arc::new(ScriptedHost::new().without_binary("dep"));
        let writer = FsCredentialWriter::new(None, std::env::temp_dir(), "1");
        let deployer = Deployer::new(
            host,
            Arc::new(writer),
            DeploySettings::default().with_binary_path("/opt/dep/bin/dep"),
        )
        .expect("deployer");
        assert_eq!(deployer.composer().binary(), std::path::Path::new("/opt/dep/bin/dep"));
    }

    #[test]
    fn test_binary_resolved_through_host() {
        let host = Arc::new(ScriptedHost::new().with_binary("dep", "/srv/app/vendor/bin/dep"));
        let writer = FsCredentialWriter::new(None, std::env::temp_dir(), "1");
        let deployer =
            Deployer::new(host, Arc::new(writer), DeploySettings::default()).expect("deployer");
        assert_eq!(
            deployer.composer().binary(),
            std::path::Path::new("/srv/app/vendor/bin/dep")
        );
    }

    #[tokio::test]
    async fn test_key_write_failure_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new());
        let writer = FsCredentialWriter::new(None, dir.path(), "1");
        let deployer = Deployer::new(host.clone(), Arc::new(writer), DeploySettings::default())
            .expect("deployer");
        let config =
            main_config(BranchConfig::new("prod").with_provision_key(ProvisionKey::Enabled(true)));

        assert!(!deployer.run(&config, "main").await);
        assert!(host.commands().is_empty());
        assert_eq!(host.logs().len(), 1);
        assert!(host.logs()[0].contains("No stored SSH keypair"));
    }

    #[tokio::test]
    async fn test_unwritable_key_path_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new());
        let target = dir.path().join("missing").join("id_rsa");
        let config =
            main_config(BranchConfig::new("prod").with_provision_key(ProvisionKey::Path(target)));

        let outcome = deployer(host.clone(), dir.path()).run_detailed(&config, "main").await;
        assert!(matches!(outcome, DeployOutcome::ComposeFailed(_)));
        assert!(!outcome.success());
        assert!(host.commands().is_empty());
        assert_eq!(host.logs().len(), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_debug_deploy() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new());
        let config = main_config(
            BranchConfig::new("production")
                .with_task("deploy")
                .with_verbosity("debug"),
        );

        assert!(deployer(host.clone(), dir.path()).run(&config, "main").await);

        let commands = host.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command, "/usr/bin/dep -vvv deploy production");
        assert!(host.logs().is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new().exit_with("/usr/bin/dep", 1));
        let config = main_config(BranchConfig::new("production"));

        assert!(!deployer(host.clone(), dir.path()).run(&config, "main").await);
        assert_eq!(host.logs(), vec!["Step 'deploy' exited with code 1".to_string()]);
    }

    #[tokio::test]
    async fn test_terminal_verdict_logged_once() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new());
        let deployer = deployer(host.clone(), dir.path());

        assert!(deployer.run(&main_config(BranchConfig::new("prod")), "develop").await);
        assert_eq!(
            host.logs(),
            vec!["There is no specified config for this branch.".to_string()]
        );
        assert!(host.commands().is_empty());

        assert!(!deployer.run(&DeploymentConfig::new(), "main").await);
        assert!(
            !deployer
                .run(&main_config(BranchConfig::default().with_task("deploy")), "main")
                .await
        );
        assert_eq!(host.logs().len(), 3);
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_verbosity_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new());
        let config = main_config(
            BranchConfig::new("prod")
                .with_verbosity("bogus")
                .with_provision_key(ProvisionKey::Enabled(true)),
        );

        let outcome = deployer(host.clone(), dir.path()).run_detailed(&config, "main").await;
        assert!(matches!(outcome, DeployOutcome::ComposeFailed(_)));
        assert!(!outcome.success());
        assert!(host.commands().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_default_keys_exported_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new());
        let config =
            main_config(BranchConfig::new("prod").with_provision_key(ProvisionKey::Enabled(true)));

        let outcome = deployer(host.clone(), dir.path()).run_detailed(&config, "main").await;
        assert!(outcome.success());

        let commands = host.commands();
        assert_eq!(commands.len(), 2);
        let deploy = &commands[0];
        assert_eq!(deploy.command, "/usr/bin/dep deploy prod");
        assert_eq!(deploy.env.len(), 2);
        assert_eq!(deploy.env[0].name, SSH_PRIVATE_KEY_ENV);
        assert_eq!(deploy.env[1].name, SSH_PUBLIC_KEY_ENV);

        let cleanup = &commands[1].command;
        assert!(cleanup.starts_with("rm -f "));
        assert!(cleanup.contains(&deploy.env[0].value));
        assert!(cleanup.contains(&deploy.env[1].value));
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_failed_deploy_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new().exit_with("/usr/bin/dep", 255));
        let config =
            main_config(BranchConfig::new("prod").with_provision_key(ProvisionKey::Enabled(true)));

        let outcome = deployer(host.clone(), dir.path()).run_detailed(&config, "main").await;
        let DeployOutcome::Executed(report) = outcome else {
            panic!("expected executed outcome");
        };
        assert!(!report.success);
        assert_eq!(report.step("deploy").unwrap().status, StepStatus::Failed);
        assert_eq!(report.step("remove_keys").unwrap().status, StepStatus::Passed);
        assert_eq!(host.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new().exit_with("/usr/bin/dep", 1));
        let config =
            main_config(BranchConfig::new("prod").with_provision_key(ProvisionKey::Enabled(true)));
        let settings = DeploySettings::default().with_cleanup_policy(CleanupPolicy::FailFast);

        let outcome = deployer_with(host.clone(), dir.path(), settings)
            .run_detailed(&config, "main")
            .await;
        let DeployOutcome::Executed(report) = outcome else {
            panic!("expected executed outcome");
        };
        assert!(!report.success);
        assert_eq!(report.step("remove_keys").unwrap().status, StepStatus::Skipped);
        assert_eq!(host.commands().len(), 1);

        // The key files are left behind, matching fail-fast semantics.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_step_failure() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new().fail_to_spawn("/usr/bin/dep"));
        let config = main_config(BranchConfig::new("prod"));

        let outcome = deployer(host.clone(), dir.path()).run_detailed(&config, "main").await;
        let DeployOutcome::Executed(report) = outcome else {
            panic!("expected executed outcome");
        };
        assert!(!report.success);
        let deploy = report.step("deploy").unwrap();
        assert_eq!(deploy.exit_code, None);
        assert!(deploy.output.contains("cannot spawn"));
        assert_eq!(host.logs().len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_does_not_execute() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(ScriptedHost::new());
        let config = main_config(BranchConfig::new("staging").with_task("rollback"));

        let plan = deployer(host.clone(), dir.path())
            .prepare(&config, "main")
            .expect("plan");
        assert_eq!(plan.deploy_command(), "/usr/bin/dep rollback staging");
        assert!(host.commands().is_empty());
    }
}
