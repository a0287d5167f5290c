//! External command execution.
//!
//! Every build, test and setup command is opaque to matrix-ci: it is a shell
//! line run in an explicit working directory under an explicit timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Stage or step name, for logs.
    pub label: String,

    /// Shell command line, run with `sh -c`.
    pub command: String,

    /// Directory the command runs in. The process cwd is never changed.
    pub working_dir: PathBuf,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Wall-clock limit.
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(
        label: impl Into<String>,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            timeout,
        }
    }

    /// Add environment variables.
    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// Outcome of a command that was started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or by the timeout.
    pub exit_code: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether the command was killed for exceeding its timeout.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// One-line description of why the command did not succeed.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return format!("timed out after {}ms", self.duration_ms);
        }
        let tail = self
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        match (self.exit_code, tail.is_empty()) {
            (Some(code), true) => format!("exited with code {code}"),
            (Some(code), false) => format!("exited with code {code}: {tail}"),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {tail}"),
        }
    }
}

/// Backend that runs opaque external commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion or timeout.
    ///
    /// Returns `Err` only when the command could not be started.
    async fn execute(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands through `sh -c` with tokio.
///
/// On unix each command leads its own process group, and a timeout kills the
/// whole group so nothing it started keeps touching the workdir.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

/// How long to wait for pipes to close once the shell itself has exited.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let start = Instant::now();
        debug!(label = %spec.label, command = %spec.command, dir = %spec.working_dir.display(), "spawning");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let stdout = PipeBuffer::drain(child.stdout.take());
        let stderr = PipeBuffer::drain(child.stderr.take());

        match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                Ok(CommandOutput {
                    exit_code: status.code(),
                    stdout: stdout.collect().await,
                    stderr: stderr.collect().await,
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                })
            }
            Err(_) => {
                kill_process_group(child.id());
                if let Err(e) = child.kill().await {
                    debug!(label = %spec.label, error = %e, "child already gone");
                }

                let mut stderr = stderr.collect().await;
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "{} timed out after {} seconds\n",
                    spec.label,
                    spec.timeout.as_secs_f64()
                ));
                Ok(CommandOutput {
                    exit_code: None,
                    stdout: stdout.collect().await,
                    stderr,
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: true,
                })
            }
        }
    }
}

/// Output captured from one pipe by a background reader.
///
/// The bytes live outside the reader task, so whatever arrived before a
/// kill is kept even if a stray descendant holds the pipe open.
struct PipeBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl PipeBuffer {
    fn drain<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let reader = pipe.map(|mut pipe| {
            let bytes = bytes.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => bytes.lock().await.extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { bytes, reader }
    }

    async fn collect(self) -> String {
        if let Some(reader) = self.reader {
            if tokio::time::timeout(PIPE_DRAIN_GRACE, reader).await.is_err() {
                debug!("pipe still open after grace period, keeping partial output");
            }
        }
        let bytes = self.bytes.lock().await;
        String::from_utf8_lossy(&bytes).to_string()
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // process_group(0) makes the group id equal to the shell's pid.
    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pgid = pid, error = %e, "process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
