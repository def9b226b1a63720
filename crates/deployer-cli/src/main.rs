//! deployer-ci - Deployer step for CI builds
//!
//! Reads the branch-keyed deploy config, composes the `dep` command for the
//! branch being built and runs it.
//!
//! ## Exit status
//!
//! - `0`: deployed, or the branch has no deploy config
//! - `1`: missing config or stage, bad verbosity, or a failed command

use anyhow::{bail, Context, Result};
use clap::Parser;
use deployer_core::{
    CleanupPolicy, CredentialWriter, DeployOutcome, DeploySettings, Deployer, DeploymentConfig,
    FsCredentialWriter, KeyMaterial, LocalHost, PreviewCredentialWriter, StepStatus,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "deployer-ci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run Deployer for the branch being built", long_about = None)]
struct Cli {
    /// Deploy config (YAML, or JSON by extension)
    #[arg(short, long, env = "DEPLOYER_CONFIG", default_value = "deploy.yml")]
    config: PathBuf,

    /// Top-level key holding the branch map
    #[arg(long)]
    section: Option<String>,

    /// Branch being built (default: current git branch)
    #[arg(short, long, env = "CI_BRANCH")]
    branch: Option<String>,

    /// Build identifier used to name generated key files
    #[arg(long, env = "CI_BUILD_ID")]
    build_id: Option<String>,

    /// Stored private key of the build
    #[arg(long, env = "DEPLOYER_PRIVATE_KEY_FILE")]
    private_key_file: Option<PathBuf>,

    /// Stored public key of the build
    #[arg(long, env = "DEPLOYER_PUBLIC_KEY_FILE")]
    public_key_file: Option<PathBuf>,

    /// Path to the dep executable (default: vendor/bin/dep, then PATH)
    #[arg(long, env = "DEPLOYER_BINARY")]
    dep_binary: Option<PathBuf>,

    /// Directory for generated key files (default: system temp dir)
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Key cleanup after a failed deploy: always or fail-fast
    #[arg(long, default_value = "always")]
    cleanup: CleanupPolicy,

    /// Per-command timeout in seconds (0 = none)
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Directory to run dep from (default: current directory)
    #[arg(short = 'C', long)]
    workdir: Option<PathBuf>,

    /// Print the plan without writing keys or running anything
    #[arg(long)]
    dry_run: bool,

    /// Print the execution report as JSON on stdout
    #[arg(long)]
    report: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    deployer_core::init_tracing(cli.json, level);

    let success = cmd_deploy(&cli).await?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_deploy(cli: &Cli) -> Result<bool> {
    let config = load_config(&cli.config, cli.section.as_deref())?;
    let branch = match &cli.branch {
        Some(branch) => branch.clone(),
        None => current_git_branch(cli.workdir.as_deref())
            .context("Could not determine the branch; pass --branch or set CI_BRANCH")?,
    };
    let build_id = cli
        .build_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string());
    let key_dir = cli.key_dir.clone().unwrap_or_else(std::env::temp_dir);

    info!(branch = %branch, build_id = %build_id, "Starting deploy step");

    let mut host = LocalHost::new().with_timeout(cli.timeout);
    if let Some(dir) = &cli.workdir {
        host = host.with_working_dir(dir);
    }

    // Relative key paths follow dep into --workdir.
    let writer: Arc<dyn CredentialWriter> = if cli.dry_run {
        let preview = PreviewCredentialWriter::new(&key_dir, &build_id);
        Arc::new(match &cli.workdir {
            Some(dir) => preview.with_base_dir(dir),
            None => preview,
        })
    } else {
        let keys = load_keys(cli.private_key_file.as_deref(), cli.public_key_file.as_deref())?;
        let fs_writer = FsCredentialWriter::new(keys, &key_dir, &build_id);
        Arc::new(match &cli.workdir {
            Some(dir) => fs_writer.with_base_dir(dir),
            None => fs_writer,
        })
    };

    let mut settings = DeploySettings::default().with_cleanup_policy(cli.cleanup);
    if let Some(path) = &cli.dep_binary {
        settings = settings.with_binary_path(path);
    }

    let deployer = Deployer::new(Arc::new(host), writer, settings)?;

    if cli.dry_run {
        return Ok(match deployer.prepare(&config, &branch) {
            Ok(plan) => {
                println!("{}", plan);
                true
            }
            Err(outcome) => outcome.success(),
        });
    }

    let outcome = deployer.run_detailed(&config, &branch).await;
    if let DeployOutcome::Executed(report) = &outcome {
        if cli.report {
            println!("{}", serde_json::to_string_pretty(report)?);
        } else {
            for step in &report.steps {
                let status = match step.status {
                    StepStatus::Passed => "✓",
                    StepStatus::Failed => "✗",
                    StepStatus::Skipped => "-",
                };
                println!("  {} {} ({}ms)", status, step.step_name, step.duration_ms);
                if step.status == StepStatus::Failed && !step.output.is_empty() {
                    println!("{}", step.output.trim_end());
                }
            }
        }
    }

    Ok(outcome.success())
}

/// Load the deploy config; a missing file counts as no configuration.
fn load_config(path: &Path, section: Option<&str>) -> Result<DeploymentConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Deploy config not found");
        return Ok(DeploymentConfig::default());
    }
    DeploymentConfig::load(path, section)
        .with_context(|| format!("Failed to load deploy config {}", path.display()))
}

/// Read the stored keypair; both files or neither.
fn load_keys(private: Option<&Path>, public: Option<&Path>) -> Result<Option<KeyMaterial>> {
    match (private, public) {
        (None, None) => Ok(None),
        (Some(private), Some(public)) => {
            let private_key = std::fs::read(private)
                .with_context(|| format!("Failed to read private key {}", private.display()))?;
            let public_key = std::fs::read(public)
                .with_context(|| format!("Failed to read public key {}", public.display()))?;
            Ok(Some(KeyMaterial::new(private_key, public_key)))
        }
        _ => bail!("--private-key-file and --public-key-file must be given together"),
    }
}

fn current_git_branch(workdir: Option<&Path>) -> Result<String> {
    let mut cmd = std::process::Command::new("git");
    cmd.args(["rev-parse", "--abbrev-ref", "HEAD"]);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    let output = cmd.output().context("Failed to run git")?;
    if !output.status.success() {
        bail!(
            "git rev-parse failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let branch = String::from_utf8(output.stdout)?.trim().to_string();
    if branch.is_empty() || branch == "HEAD" {
        bail!("HEAD is detached");
    }
    Ok(branch)
}
