//! Dependency installer: the setup procedure shared by all variants.
//!
//! Steps run strictly in order and the first failure aborts the sequence.
//! Only fetch steps are retried; a failing unpack, configure, build or install
//! step is deterministic and reported immediately.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::command::{CommandExecutor, CommandSpec};
use crate::config::SetupStep;
use crate::error::InstallError;
use crate::retry::{retry_with_backoff, RetryFailure, RetryPolicy};

/// Outcome of one completed setup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupStepReport {
    pub name: String,
    /// Whether the step was retry-eligible.
    pub fetch: bool,
    /// Attempts made (always 1 for non-fetch steps).
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Outcome of a successful install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub steps: Vec<SetupStepReport>,
}

impl InstallReport {
    /// Total attempts spent on fetch steps.
    pub fn fetch_attempts(&self) -> u32 {
        self.steps
            .iter()
            .filter(|s| s.fetch)
            .map(|s| s.attempts)
            .sum()
    }
}

/// Why a single fetch attempt failed.
#[derive(Debug)]
enum FetchError {
    /// Timeout, connection or server error; worth another attempt.
    Transient(String),
    /// Deterministic failure; retrying cannot help.
    Rejected(String),
    Spawn(std::io::Error),
}

impl FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transient(reason) | FetchError::Rejected(reason) => f.write_str(reason),
            FetchError::Spawn(err) => write!(f, "spawn failed: {err}"),
        }
    }
}

/// Runs setup steps through a `CommandExecutor`, retrying fetches.
pub struct DependencyInstaller {
    executor: Arc<dyn CommandExecutor>,
    retry: RetryPolicy,
    default_timeout: Duration,
    http: reqwest::Client,
}

impl DependencyInstaller {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        retry: RetryPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            retry,
            default_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Run every step in order.
    ///
    /// `workdir` is the base directory; a step's `dir` is resolved against it.
    pub async fn install(
        &self,
        steps: &[SetupStep],
        workdir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<InstallReport, InstallError> {
        let mut report = InstallReport::default();

        for step in steps {
            let start = Instant::now();
            info!(step = %step.name, fetch = step.is_fetch(), "running setup step");

            let attempts = if step.is_fetch() {
                self.run_fetch(step, workdir, env).await?
            } else {
                self.run_once(step, workdir, env).await?;
                1
            };

            report.steps.push(SetupStepReport {
                name: step.name.clone(),
                fetch: step.is_fetch(),
                attempts,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        info!(steps = report.steps.len(), "setup complete");
        Ok(report)
    }

    async fn run_once(
        &self,
        step: &SetupStep,
        workdir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), InstallError> {
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let spec = self.command_spec(step, workdir, env, timeout);

        let output = self
            .executor
            .execute(&spec)
            .await
            .map_err(|source| InstallError::Spawn {
                step: step.name.clone(),
                source,
            })?;

        if output.succeeded() {
            Ok(())
        } else {
            warn!(step = %step.name, reason = %output.failure_reason(), "setup step failed");
            Err(InstallError::StepFailed {
                step: step.name.clone(),
                exit_code: output.exit_code,
                reason: output.failure_reason(),
            })
        }
    }

    /// Run a fetch step under the retry policy. Returns attempts used.
    async fn run_fetch(
        &self,
        step: &SetupStep,
        workdir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<u32, InstallError> {
        let result = retry_with_backoff(
            &self.retry,
            &step.name,
            |_attempt| self.fetch_attempt(step, workdir, env),
            FetchError::is_transient,
        )
        .await;

        match result {
            Ok(done) => Ok(done.attempts),
            Err(RetryFailure {
                error, attempts, ..
            }) => Err(match error {
                FetchError::Transient(reason) => InstallError::Network {
                    step: step.name.clone(),
                    attempts,
                    reason,
                },
                FetchError::Rejected(reason) => InstallError::FetchRejected {
                    step: step.name.clone(),
                    reason,
                },
                FetchError::Spawn(source) => InstallError::Spawn {
                    step: step.name.clone(),
                    source,
                },
            }),
        }
    }

    async fn fetch_attempt(
        &self,
        step: &SetupStep,
        workdir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<(), FetchError> {
        let timeout = self.attempt_timeout(step);
        if let (Some(url), Some(dest)) = (&step.url, &step.dest) {
            let dest = step_dir(step, workdir).join(dest);
            return self.download(url, &dest, timeout).await;
        }

        let spec = self.command_spec(step, workdir, env, timeout);
        let output = self
            .executor
            .execute(&spec)
            .await
            .map_err(FetchError::Spawn)?;
        if output.succeeded() {
            Ok(())
        } else {
            Err(FetchError::Transient(output.failure_reason()))
        }
    }

    /// A fetch step's own timeout bounds each attempt, else the policy's.
    fn attempt_timeout(&self, step: &SetupStep) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.retry.attempt_timeout())
    }

    async fn download(&self, url: &str, dest: &Path, timeout: Duration) -> Result<(), FetchError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("GET {url}: HTTP {status}");
            return Err(if is_transient_status(status) {
                FetchError::Transient(reason)
            } else {
                FetchError::Rejected(reason)
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(format!("GET {url}: reading body: {e}")))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Rejected(format!("creating {}: {e}", parent.display())))?;
        }
        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| FetchError::Rejected(format!("writing {}: {e}", dest.display())))?;

        info!(url, dest = %dest.display(), bytes = body.len(), "downloaded");
        Ok(())
    }

    fn command_spec(
        &self,
        step: &SetupStep,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> CommandSpec {
        CommandSpec::new(
            step.name.clone(),
            step.command.clone().unwrap_or_default(),
            step_dir(step, workdir),
            timeout,
        )
        .with_env(env)
    }
}

fn step_dir(step: &SetupStep, workdir: &Path) -> std::path::PathBuf {
    match &step.dir {
        Some(dir) => workdir.join(dir),
        None => workdir.to_path_buf(),
    }
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}
