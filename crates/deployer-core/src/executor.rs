//! Command plan execution.

use crate::composer::{CommandPlan, PlanStep};
use crate::host::BuildHost;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, warn};

/// What happens to key removal once an earlier step failed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupPolicy {
    /// Key removal runs even after a failed deploy.
    #[default]
    Always,

    /// Key removal is skipped like every other step after a failure.
    FailFast,
}

impl FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(CleanupPolicy::Always),
            "fail-fast" | "fail_fast" | "failfast" => Ok(CleanupPolicy::FailFast),
            other => Err(format!(
                "unknown cleanup policy '{}' (expected always or fail-fast)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// Result of one plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name (`export_env`, `deploy`, `remove_keys`).
    pub step_name: String,

    /// Shell command, if the step runs one.
    pub command: Option<String>,

    pub status: StepStatus,

    /// Exit code; `None` when nothing was executed.
    pub exit_code: Option<i32>,

    /// Combined command output, or the execution error.
    pub output: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Passed
    }

    fn skipped(step: &PlanStep) -> Self {
        Self {
            step_name: step.name().to_string(),
            command: step.command().map(str::to_string),
            status: StepStatus::Skipped,
            exit_code: None,
            output: String::new(),
            duration_ms: 0,
        }
    }
}

/// Result of executing a whole plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub started_at: DateTime<Utc>,

    /// Whether every step passed.
    pub success: bool,

    pub steps: Vec<StepResult>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn passed_count(&self) -> usize {
        self.count(StepStatus::Passed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    /// Result of the named step, if it is part of the plan.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// Runs plan steps in order through a [`BuildHost`].
pub struct PlanExecutor;

impl PlanExecutor {
    /// Execute `plan` step by step.
    ///
    /// The first failing step marks the run failed and every later step is
    /// skipped, except key removal under [`CleanupPolicy::Always`]. Bindings
    /// from an `ExportEnv` step apply to every command after it.
    pub async fn execute(
        host: &dyn BuildHost,
        plan: &CommandPlan,
        policy: CleanupPolicy,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut env = Vec::new();
        let mut results = Vec::with_capacity(plan.len());
        let mut failed = false;

        for step in plan.steps() {
            let is_cleanup = matches!(step, PlanStep::RemoveKeys { .. });
            if failed && !(is_cleanup && policy == CleanupPolicy::Always) {
                info!(step = step.name(), "Skipping step after failure");
                results.push(StepResult::skipped(step));
                continue;
            }

            let command = match step {
                PlanStep::ExportEnv(bindings) => {
                    env.extend(bindings.iter().cloned());
                    results.push(StepResult {
                        step_name: step.name().to_string(),
                        command: None,
                        status: StepStatus::Passed,
                        exit_code: None,
                        output: String::new(),
                        duration_ms: 0,
                    });
                    continue;
                }
                PlanStep::Deploy(command) | PlanStep::RemoveKeys { command, .. } => command,
            };

            info!(step = step.name(), command = %command, "Executing step");
            let step_start = Instant::now();
            let outcome = host.execute_command(command, &env).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            let result = match outcome {
                Ok(output) => {
                    let status = if output.success() {
                        StepStatus::Passed
                    } else {
                        host.log(&format!(
                            "Step '{}' exited with code {}",
                            step.name(),
                            output.exit_code
                        ));
                        StepStatus::Failed
                    };
                    StepResult {
                        step_name: step.name().to_string(),
                        command: Some(command.clone()),
                        status,
                        exit_code: Some(output.exit_code),
                        output: output.output,
                        duration_ms,
                    }
                }
                Err(e) => {
                    host.log(&format!("Step '{}' could not be executed: {}", step.name(), e));
                    StepResult {
                        step_name: step.name().to_string(),
                        command: Some(command.clone()),
                        status: StepStatus::Failed,
                        exit_code: None,
                        output: e.to_string(),
                        duration_ms,
                    }
                }
            };

            if !result.passed() {
                warn!(step = step.name(), exit_code = ?result.exit_code, "Step failed");
                failed = true;
            }
            results.push(result);
        }

        ExecutionReport {
            started_at,
            success: !failed,
            steps: results,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}
