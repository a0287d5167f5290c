//! Per-variant stage execution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::command::{CommandExecutor, CommandOutput, CommandSpec};
use crate::matrix::ToolchainVariant;
use crate::stage::Stage;

/// Status of one stage for one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failure,
    /// Disabled in the configuration; not executed.
    Skipped,
}

/// Result of a stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    pub status: StageStatus,

    /// Exit code; `None` on timeout, signal, spawn failure or skip.
    pub exit_code: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    /// Whether this stage passed.
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Success
    }

    pub fn failed(&self) -> bool {
        self.status == StageStatus::Failure
    }

    pub(crate) fn from_output(stage_name: &str, output: CommandOutput) -> Self {
        let status = if output.succeeded() {
            StageStatus::Success
        } else {
            StageStatus::Failure
        };
        Self {
            stage_name: stage_name.to_string(),
            status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration_ms,
        }
    }

    pub(crate) fn skipped(stage_name: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            status: StageStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        }
    }

    /// A failure that happened before or around the command itself.
    pub(crate) fn errored(stage_name: &str, reason: String, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            status: StageStatus::Failure,
            exit_code: None,
            stdout: String::new(),
            stderr: reason,
            duration_ms,
        }
    }
}

/// Terminal status of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantStatus {
    Passed,
    Failed,
    FailedButAllowed,
}

impl VariantStatus {
    /// Status for a variant whose sequence halted on a failure.
    pub fn for_failure(variant: &ToolchainVariant) -> Self {
        if variant.allowed_to_fail {
            VariantStatus::FailedButAllowed
        } else {
            VariantStatus::Failed
        }
    }

    /// Whether this status reddens the pipeline.
    pub fn is_blocking(&self) -> bool {
        *self == VariantStatus::Failed
    }
}

/// The stage results of one variant. Sealed once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRun {
    pub variant: ToolchainVariant,

    /// Results for a contiguous prefix of the stage sequence.
    pub stages: Vec<StageResult>,

    pub status: VariantStatus,
}

impl VariantRun {
    /// Seal a variant from its stage results.
    pub fn seal(variant: ToolchainVariant, stages: Vec<StageResult>) -> Self {
        let status = if stages.iter().any(StageResult::failed) {
            VariantStatus::for_failure(&variant)
        } else {
            VariantStatus::Passed
        };
        Self {
            variant,
            stages,
            status,
        }
    }

    /// The stage that halted the sequence, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.failed())
    }

    /// Number of stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of stages that were executed or skipped.
    pub fn recorded_count(&self) -> usize {
        self.stages.len()
    }
}

/// Executes the stage sequence for one variant, fail-fast.
#[derive(Clone)]
pub struct StageRunner {
    executor: Arc<dyn CommandExecutor>,
    workdir: PathBuf,
    env: BTreeMap<String, String>,
}

impl StageRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        workdir: impl Into<PathBuf>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            executor,
            workdir: workdir.into(),
            env,
        }
    }

    /// Run `stages` in order for `variant`, stopping at the first failure.
    pub async fn run(&self, variant: &ToolchainVariant, stages: &[Stage]) -> VariantRun {
        self.run_with_prefix(variant, Vec::new(), stages).await
    }

    /// Like [`run`](Self::run), continuing from already recorded results.
    ///
    /// If `prefix` already holds a failure no stage is executed.
    pub async fn run_with_prefix(
        &self,
        variant: &ToolchainVariant,
        mut results: Vec<StageResult>,
        stages: &[Stage],
    ) -> VariantRun {
        if results.iter().any(StageResult::failed) {
            return VariantRun::seal(variant.clone(), results);
        }

        for stage in stages {
            if !stage.enabled {
                info!(toolchain = %variant.toolchain, stage = %stage.name, "skipping disabled stage");
                results.push(StageResult::skipped(&stage.name));
                continue;
            }

            info!(toolchain = %variant.toolchain, stage = %stage.name, "executing stage");
            let result = self.execute_stage(variant, stage).await;

            if result.failed() {
                warn!(
                    toolchain = %variant.toolchain,
                    stage = %stage.name,
                    exit_code = ?result.exit_code,
                    allowed_to_fail = variant.allowed_to_fail,
                    "stage failed, halting variant"
                );
                results.push(result);
                break;
            }
            results.push(result);
        }

        let run = VariantRun::seal(variant.clone(), results);
        info!(toolchain = %variant.toolchain, status = ?run.status, "variant sealed");
        run
    }

    async fn execute_stage(&self, variant: &ToolchainVariant, stage: &Stage) -> StageResult {
        let start = Instant::now();
        let spec = CommandSpec::new(
            stage.name.clone(),
            stage.command_for(&variant.toolchain),
            self.workdir.clone(),
            stage.timeout,
        )
        .with_env(&self.env)
        .with_env(&variant.env());

        match self.executor.execute(&spec).await {
            Ok(output) => StageResult::from_output(&stage.name, output),
            Err(e) => StageResult::errored(
                &stage.name,
                format!("stage '{}' could not be started: {e}", stage.name),
                start.elapsed().as_millis() as u64,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedExecutor;
    use crate::matrix::expand;
    use crate::stage::StageConfig;
    use std::time::Duration;

    fn stages(specs: &[(&str, &str)]) -> Vec<Stage> {
        specs
            .iter()
            .map(|(name, cmd)| Stage::resolve(&StageConfig::custom(*name, *cmd), Duration::from_secs(30)))
            .collect()
    }

    fn variant(toolchain: &str, allowed_to_fail: bool) -> ToolchainVariant {
        let allow = if allowed_to_fail { vec![toolchain] } else { Vec::new() };
        expand(&[toolchain], &allow).remove(0)
    }

    fn runner(exec: Arc<ScriptedExecutor>) -> StageRunner {
        StageRunner::new(exec, ".", BTreeMap::new())
    }

    #[test]
    fn test_stage_result_passed() {
        let result = StageResult::from_output(
            "lint",
            CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            },
        );
        assert!(result.passed());
        assert!(!result.failed());
    }

    #[test]
    fn test_stage_result_failed() {
        let result = StageResult::from_output(
            "lint",
            CommandOutput {
                exit_code: Some(1),
                stderr: "error".to_string(),
                ..Default::default()
            },
        );
        assert!(!result.passed());
        assert!(result.failed());
    }

    #[tokio::test]
    async fn test_all_stages_pass() {
        let exec = Arc::new(ScriptedExecutor::new());
        let variant = &variant("stable", false);
        let run = runner(exec.clone())
            .run(variant, &stages(&[("lint", "a"), ("build", "b"), ("test", "c")]))
            .await;

        assert_eq!(run.status, VariantStatus::Passed);
        assert_eq!(run.passed_count(), 3);
        assert!(run.failed_stage().is_none());
    }

    #[tokio::test]
    async fn test_halts_at_first_failure() {
        let exec = Arc::new(ScriptedExecutor::new().fail("b", 1));
        let variant = &variant("stable", false);
        let run = runner(exec.clone())
            .run(variant, &stages(&[("A", "a"), ("B", "b"), ("C", "c")]))
            .await;

        let names: Vec<_> = run.stages.iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(run.status, VariantStatus::Failed);
        assert_eq!(run.failed_stage().map(|s| s.stage_name.as_str()), Some("B"));
        assert_eq!(exec.call_count("c"), 0);
    }

    #[tokio::test]
    async fn test_allowed_variant_downgrades_any_stage_failure() {
        for failing in ["a", "b", "c"] {
            let exec = Arc::new(ScriptedExecutor::new().fail(failing, 2));
            let variant = &variant("nightly", true);
            let run = runner(exec)
                .run(variant, &stages(&[("A", "a"), ("B", "b"), ("C", "c")]))
                .await;
            assert_eq!(run.status, VariantStatus::FailedButAllowed);
        }
    }

    #[tokio::test]
    async fn test_disabled_stage_recorded_as_skipped() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut seq = stages(&[("lint", "a"), ("bench", "b"), ("test", "c")]);
        seq[1].enabled = false;
        let variant = &variant("stable", false);
        let run = runner(exec.clone()).run(variant, &seq).await;

        assert_eq!(run.stages.len(), 3);
        assert_eq!(run.stages[1].status, StageStatus::Skipped);
        assert_eq!(run.status, VariantStatus::Passed);
        assert_eq!(exec.call_count("b"), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let exec = Arc::new(ScriptedExecutor::new().time_out("b"));
        let variant = &variant("stable", false);
        let run = runner(exec)
            .run(variant, &stages(&[("A", "a"), ("B", "b")]))
            .await;
        assert_eq!(run.status, VariantStatus::Failed);
        assert!(run.stages[1].exit_code.is_none());
    }

    #[tokio::test]
    async fn test_spawn_error_is_failure() {
        let exec = Arc::new(ScriptedExecutor::new().unspawnable("a"));
        let variant = &variant("stable", false);
        let run = runner(exec).run(variant, &stages(&[("A", "a"), ("B", "b")])).await;
        assert_eq!(run.stages.len(), 1);
        assert!(run.stages[0].stderr.contains("could not be started"));
    }

    #[tokio::test]
    async fn test_commands_receive_toolchain() {
        let exec = Arc::new(ScriptedExecutor::new());
        let variant = &variant("beta", false);
        runner(exec.clone())
            .run(variant, &stages(&[("build", "cargo +{toolchain} build")]))
            .await;

        let call = &exec.calls()[0];
        assert_eq!(call.command, "cargo +beta build");
        assert_eq!(call.env.get("RUSTUP_TOOLCHAIN").map(String::as_str), Some("beta"));
    }

    #[tokio::test]
    async fn test_failed_prefix_runs_nothing() {
        let exec = Arc::new(ScriptedExecutor::new());
        let variant = &variant("stable", false);
        let setup = StageResult::errored("setup", "fetch failed".into(), 5);
        let run = runner(exec.clone())
            .run_with_prefix(variant, vec![setup], &stages(&[("A", "a")]))
            .await;
        assert_eq!(run.stages.len(), 1);
        assert_eq!(run.status, VariantStatus::Failed);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_stage_list_passes() {
        let exec = Arc::new(ScriptedExecutor::new());
        let variant = &variant("stable", false);
        let run = runner(exec).run(variant, &[]).await;
        assert_eq!(run.status, VariantStatus::Passed);
        assert!(run.stages.is_empty());
    }
}
