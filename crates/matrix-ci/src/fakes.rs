//! In-memory fakes for the command seam (testing only)
//!
//! `ScriptedExecutor` satisfies `CommandExecutor` without spawning processes:
//! every command exits 0 unless a rule says otherwise, and every invocation is
//! recorded for later assertions.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::command::{CommandExecutor, CommandOutput, CommandSpec};
use crate::matrix::TOOLCHAIN_ENV;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Exit(i32),
    Timeout,
    SpawnError,
}

#[derive(Debug)]
struct Rule {
    command: String,
    toolchain: Option<String>,
    outcome: Outcome,
    /// How many more matching calls this rule applies to; `None` = forever.
    remaining: Option<u32>,
}

impl Rule {
    fn matches(&self, spec: &CommandSpec) -> bool {
        if self.command != spec.command || self.remaining == Some(0) {
            return false;
        }
        match &self.toolchain {
            Some(t) => spec.env.get(TOOLCHAIN_ENV) == Some(t),
            None => true,
        }
    }
}

/// Scripted `CommandExecutor` keyed by exact command line.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(
        self,
        command: &str,
        toolchain: Option<&str>,
        outcome: Outcome,
        remaining: Option<u32>,
    ) -> Self {
        self.rules.lock().unwrap().push(Rule {
            command: command.to_string(),
            toolchain: toolchain.map(str::to_string),
            outcome,
            remaining,
        });
        self
    }

    /// `command` always exits with `exit_code`.
    pub fn fail(self, command: &str, exit_code: i32) -> Self {
        self.rule(command, None, Outcome::Exit(exit_code), None)
    }

    /// `command` exits with `exit_code` only when run for `toolchain`.
    pub fn fail_for(self, command: &str, toolchain: &str, exit_code: i32) -> Self {
        self.rule(command, Some(toolchain), Outcome::Exit(exit_code), None)
    }

    /// The first `times` runs of `command` exit with `exit_code`; later runs pass.
    pub fn fail_times(self, command: &str, times: u32, exit_code: i32) -> Self {
        self.rule(command, None, Outcome::Exit(exit_code), Some(times))
    }

    /// `command` always hits its timeout.
    pub fn time_out(self, command: &str) -> Self {
        self.rule(command, None, Outcome::Timeout, None)
    }

    /// `command` can never be started.
    pub fn unspawnable(self, command: &str) -> Self {
        self.rule(command, None, Outcome::SpawnError, None)
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of times `command` was invoked.
    pub fn call_count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.command == command)
            .count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());

        let outcome = {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.matches(spec)) {
                Some(rule) => {
                    if let Some(n) = rule.remaining.as_mut() {
                        *n -= 1;
                    }
                    rule.outcome
                }
                None => Outcome::Exit(0),
            }
        };

        match outcome {
            Outcome::Exit(code) => Ok(CommandOutput {
                exit_code: Some(code),
                stdout: format!("ran {}\n", spec.command),
                stderr: if code == 0 {
                    String::new()
                } else {
                    format!("{} failed\n", spec.command)
                },
                duration_ms: 1,
                timed_out: false,
            }),
            Outcome::Timeout => Ok(CommandOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("{} timed out", spec.label),
                duration_ms: spec.timeout.as_millis() as u64,
                timed_out: true,
            }),
            Outcome::SpawnError => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", spec.command),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn spec(command: &str) -> CommandSpec {
        CommandSpec::new("t", command, ".", Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_default_outcome_is_success() {
        let exec = ScriptedExecutor::new();
        let out = exec.execute(&spec("anything")).await.unwrap();
        assert!(out.succeeded());
        assert_eq!(exec.call_count("anything"), 1);
    }

    #[tokio::test]
    async fn test_fail_times_then_pass() {
        let exec = ScriptedExecutor::new().fail_times("wget", 2, 4);
        assert!(!exec.execute(&spec("wget")).await.unwrap().succeeded());
        assert!(!exec.execute(&spec("wget")).await.unwrap().succeeded());
        assert!(exec.execute(&spec("wget")).await.unwrap().succeeded());
        assert_eq!(exec.call_count("wget"), 3);
    }

    #[tokio::test]
    async fn test_fail_for_matches_toolchain_env() {
        let exec = ScriptedExecutor::new().fail_for("cargo test", "beta", 101);
        let mut env = BTreeMap::new();
        env.insert(TOOLCHAIN_ENV.to_string(), "beta".to_string());
        let beta = spec("cargo test").with_env(&env);
        env.insert(TOOLCHAIN_ENV.to_string(), "stable".to_string());
        let stable = spec("cargo test").with_env(&env);

        assert_eq!(exec.execute(&beta).await.unwrap().exit_code, Some(101));
        assert!(exec.execute(&stable).await.unwrap().succeeded());
    }
}
