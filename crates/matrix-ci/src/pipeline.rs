//! Pipeline orchestration: setup, matrix dispatch and verdict.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::command::{CommandExecutor, ShellExecutor};
use crate::config::{CiConfig, InstallScope, SetupStep};
use crate::error::Result;
use crate::gate::{FailureClassifier, Verdict};
use crate::identity::{config_digest, names_digest};
use crate::installer::{DependencyInstaller, InstallReport};
use crate::matrix::{expand, ToolchainVariant};
use crate::runner::{StageResult, StageRunner, StageStatus, VariantRun, VariantStatus};
use crate::stage::{Stage, SETUP_STAGE};

/// Exit code for a Green verdict.
pub const EXIT_GREEN: i32 = 0;
/// Exit code when a blocking variant failed.
pub const EXIT_BLOCKING_FAILURE: i32 = 1;
/// Exit code when the shared setup failed.
pub const EXIT_INSTALL_FAILED: i32 = 2;
/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: i32 = 3;
/// Exit code for unexpected internal errors (I/O writing reports, etc).
pub const EXIT_INTERNAL: i32 = 4;

/// Controller state machine.
///
/// `NotStarted -> Installing -> InstallFailed` (terminal), or
/// `NotStarted -> [Installing ->] Running(0) -> ... -> Running(n-1) -> Sealed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Installing,
    InstallFailed,
    Running { variant_index: usize },
    Sealed,
}

impl PipelineState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::InstallFailed | PipelineState::Sealed)
    }
}

/// Result of a complete pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,

    /// Digest of the configuration.
    pub config_digest: String,

    /// Digest of the ordered stage names.
    pub stages_digest: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub state: PipelineState,

    /// Shared setup report, when setup ran once and succeeded.
    pub install: Option<InstallReport>,

    /// Shared setup failure; no variants run when set.
    pub install_error: Option<String>,

    /// Variant runs, in matrix order.
    pub variants: Vec<VariantRun>,

    pub verdict: Verdict,
}

impl PipelineRun {
    /// A fresh, unsealed run.
    pub fn new(config_digest: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config_digest,
            stages_digest: String::new(),
            started_at: Utc::now(),
            finished_at: None,
            state: PipelineState::NotStarted,
            install: None,
            install_error: None,
            variants: Vec::new(),
            verdict: Verdict::Green,
        }
    }

    /// Whether the run can no longer change.
    pub fn is_sealed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of variants with the given status.
    pub fn count(&self, status: VariantStatus) -> usize {
        self.variants.iter().filter(|v| v.status == status).count()
    }

    /// Total wall-clock duration in milliseconds, once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }

    /// Process exit code: distinct for setup failure and blocking failure.
    pub fn exit_code(&self) -> i32 {
        if self.state == PipelineState::InstallFailed {
            EXIT_INSTALL_FAILED
        } else if self.verdict.is_green() {
            EXIT_GREEN
        } else {
            EXIT_BLOCKING_FAILURE
        }
    }
}

/// Owns one end-to-end pipeline run.
pub struct PipelineController {
    config: CiConfig,
    executor: Arc<dyn CommandExecutor>,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl PipelineController {
    /// Create a controller for an already validated configuration.
    pub fn new(config: CiConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            config,
            executor,
            state: PipelineState::NotStarted,
            history: vec![PipelineState::NotStarted],
        }
    }

    /// Controller that runs real shell commands.
    pub fn with_shell(config: CiConfig) -> Self {
        Self::new(config, Arc::new(ShellExecutor))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn config(&self) -> &CiConfig {
        &self.config
    }

    fn transition(&mut self, run: &mut PipelineRun, next: PipelineState) {
        info!(run_id = %run.run_id, from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
        self.history.push(next);
        run.state = next;
    }

    /// Run setup, every variant, and classify.
    ///
    /// Setup and stage failures are recorded in the returned report, never
    /// raised. `Err` means the run could not be started at all.
    pub async fn run(&mut self) -> Result<PipelineRun> {
        let mut run = PipelineRun::new(config_digest(&self.config)?);
        let stages = self.config.stages();
        run.stages_digest =
            names_digest(&stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>());
        info!(run_id = %run.run_id, toolchains = ?self.config.toolchains, "starting pipeline");

        let setup = self.config.setup_commands.clone();
        let workdir = self.config.workdir.clone();
        let env = self.config.env.clone();
        let installer = DependencyInstaller::new(
            self.executor.clone(),
            self.config.retry.clone(),
            self.config.default_timeout(),
        );

        if self.config.install == InstallScope::Once {
            self.transition(&mut run, PipelineState::Installing);
            match installer.install(&setup, &workdir, &env).await {
                Ok(report) => run.install = Some(report),
                Err(e) => {
                    error!(run_id = %run.run_id, step = e.step(), error = %e, "setup failed, cancelling all variants");
                    run.install_error = Some(e.to_string());
                    self.transition(&mut run, PipelineState::InstallFailed);
                    return Ok(Self::finish(run));
                }
            }
        }

        let variants = expand(&self.config.toolchains, &self.config.allow_failures);
        let runner = StageRunner::new(self.executor.clone(), workdir.clone(), env.clone());
        let per_variant_setup = match self.config.install {
            InstallScope::PerVariant => Some(VariantSetup {
                installer: &installer,
                steps: &setup,
                workdir: &workdir,
                env: &env,
            }),
            InstallScope::Once => None,
        };

        let parallel = self.config.parallel && per_variant_setup.is_none();
        if self.config.parallel && !parallel {
            warn!("per-variant setup shares the workdir, running variants sequentially");
        }

        if parallel {
            for variant in &variants {
                self.transition(
                    &mut run,
                    PipelineState::Running {
                        variant_index: variant.index,
                    },
                );
            }
            let dispatched = variants
                .iter()
                .map(|v| run_variant(&runner, per_variant_setup.as_ref(), v, &stages));
            // join_all keeps input order, so the report follows the matrix.
            run.variants = join_all(dispatched).await;
        } else {
            for variant in &variants {
                self.transition(
                    &mut run,
                    PipelineState::Running {
                        variant_index: variant.index,
                    },
                );
                let result = run_variant(&runner, per_variant_setup.as_ref(), variant, &stages).await;
                run.variants.push(result);
            }
        }

        self.transition(&mut run, PipelineState::Sealed);
        Ok(Self::finish(run))
    }

    fn finish(mut run: PipelineRun) -> PipelineRun {
        run.finished_at = Some(Utc::now());
        run.verdict = FailureClassifier::classify(&run);
        info!(
            run_id = %run.run_id,
            verdict = ?run.verdict,
            passed = run.count(VariantStatus::Passed),
            failed = run.count(VariantStatus::Failed),
            allowed = run.count(VariantStatus::FailedButAllowed),
            "pipeline finished"
        );
        run
    }
}

/// Setup that runs inside each variant.
struct VariantSetup<'a> {
    installer: &'a DependencyInstaller,
    steps: &'a [SetupStep],
    workdir: &'a Path,
    env: &'a BTreeMap<String, String>,
}

async fn run_variant(
    runner: &StageRunner,
    setup: Option<&VariantSetup<'_>>,
    variant: &ToolchainVariant,
    stages: &[Stage],
) -> VariantRun {
    let mut prefix = Vec::new();

    if let Some(setup) = setup {
        let start = Instant::now();
        info!(toolchain = %variant.toolchain, "running per-variant setup");
        let mut env = setup.env.clone();
        env.extend(variant.env());
        let result = setup
            .installer
            .install(setup.steps, setup.workdir, &env)
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;
        prefix.push(match result {
            Ok(report) => StageResult {
                stage_name: SETUP_STAGE.to_string(),
                status: StageStatus::Success,
                exit_code: Some(0),
                stdout: format!(
                    "{} setup step(s), {} fetch attempt(s)\n",
                    report.steps.len(),
                    report.fetch_attempts()
                ),
                stderr: String::new(),
                duration_ms,
            },
            Err(e) => {
                warn!(toolchain = %variant.toolchain, error = %e, "per-variant setup failed");
                StageResult::errored(SETUP_STAGE, e.to_string(), duration_ms)
            }
        });
    }

    runner.run_with_prefix(variant, prefix, stages).await
}
