//! Pipeline configuration: loading, defaults and validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::stage::{Stage, StageConfig};

/// Where the dependency setup procedure runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallScope {
    /// Once before any variant; failure aborts the whole run.
    #[default]
    Once,
    /// Inside every variant, recorded as its leading `setup` stage.
    PerVariant,
}

/// One step of the dependency setup procedure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupStep {
    /// Step name, e.g. `fetch`, `configure`.
    pub name: String,

    /// Shell command line. Mutually exclusive with `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Marks a shell step as a network fetch, eligible for retry.
    #[serde(default)]
    pub fetch: bool,

    /// Download this URL natively instead of running a command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Destination file for `url`, relative to the step's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<PathBuf>,

    /// Working directory, relative to the pipeline workdir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Timeout in seconds; for fetch steps it bounds each attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl SetupStep {
    /// Shell step.
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Retry-eligible shell step.
    pub fn fetch_command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            fetch: true,
            ..Self::command(name, command)
        }
    }

    /// Native HTTP download.
    pub fn download(
        name: impl Into<String>,
        url: impl Into<String>,
        dest: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            url: Some(url.into()),
            dest: Some(dest.into()),
            fetch: true,
            ..Default::default()
        }
    }

    /// Run in a subdirectory of the workdir.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Whether the step is retried on failure.
    pub fn is_fetch(&self) -> bool {
        self.fetch || self.url.is_some()
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_timeout_secs() -> u64 {
    3600
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CiConfig {
    /// Toolchains to verify, in reporting order.
    pub toolchains: Vec<String>,

    /// Toolchains whose failure is advisory.
    #[serde(default)]
    pub allow_failures: Vec<String>,

    /// Dependency setup procedure.
    #[serde(default)]
    pub setup_commands: Vec<SetupStep>,

    /// Verification stages run for every toolchain.
    #[serde(default = "StageConfig::default_sequence")]
    pub stage_commands: Vec<StageConfig>,

    /// Project directory every command runs in.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    #[serde(default)]
    pub install: InstallScope,

    /// Run variants concurrently.
    #[serde(default)]
    pub parallel: bool,

    /// Timeout for commands without their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Extra environment for every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CiConfig {
    /// Configuration with the builtin stage sequence and no setup.
    pub fn new<S: Into<String>>(toolchains: impl IntoIterator<Item = S>) -> Self {
        Self {
            toolchains: toolchains.into_iter().map(Into::into).collect(),
            allow_failures: Vec::new(),
            setup_commands: Vec::new(),
            stage_commands: StageConfig::default_sequence(),
            workdir: default_workdir(),
            install: InstallScope::Once,
            parallel: false,
            default_timeout_secs: default_timeout_secs(),
            retry: RetryPolicy::default(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_allow_failures<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.allow_failures = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_setup(mut self, steps: Vec<SetupStep>) -> Self {
        self.setup_commands = steps;
        self
    }

    pub fn with_stages(mut self, stages: Vec<StageConfig>) -> Self {
        self.stage_commands = stages;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    /// Load and validate a config file.
    ///
    /// `.json` files are parsed as JSON, everything else as TOML. A relative
    /// `workdir` is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config = if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
        .map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;

        if config.workdir.is_relative() {
            if let Some(parent) = path.parent() {
                config.workdir = parent.join(&config.workdir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }

    /// Reject configurations that cannot be run safely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.default_timeout_secs == 0 {
            return invalid("default_timeout_secs must be greater than zero".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.attempt_timeout_secs == 0 {
            return invalid("retry.attempt_timeout_secs must be greater than zero".into());
        }
        if let Some(t) = self.toolchains.iter().find(|t| t.trim().is_empty()) {
            return invalid(format!("toolchain identifier {t:?} is empty"));
        }

        for (i, step) in self.setup_commands.iter().enumerate() {
            if step.name.trim().is_empty() {
                return invalid(format!("setup_commands[{i}] has an empty name"));
            }
            match (&step.command, &step.url) {
                (Some(_), Some(_)) => {
                    return invalid(format!(
                        "setup step '{}' sets both command and url",
                        step.name
                    ))
                }
                (None, None) => {
                    return invalid(format!(
                        "setup step '{}' needs a command or a url",
                        step.name
                    ))
                }
                (Some(cmd), None) if cmd.trim().is_empty() => {
                    return invalid(format!("setup step '{}' has an empty command", step.name))
                }
                (None, Some(_)) if step.dest.is_none() => {
                    return invalid(format!("setup step '{}' has a url but no dest", step.name))
                }
                _ => {}
            }
            if step.timeout_secs == Some(0) {
                return invalid(format!("setup step '{}' has a zero timeout", step.name));
            }
        }

        for (i, stage) in self.stage_commands.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return invalid(format!("stage_commands[{i}] has an empty name"));
            }
            if stage.command.trim().is_empty() {
                return invalid(format!("stage '{}' has an empty command", stage.name));
            }
            if stage.timeout_secs == Some(0) {
                return invalid(format!("stage '{}' has a zero timeout", stage.name));
            }
        }

        for id in &self.allow_failures {
            if !self.toolchains.contains(id) {
                warn!(toolchain = %id, "allow_failures entry is not in the toolchain matrix");
            }
        }

        Ok(())
    }

    /// Timeout for commands without their own.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Resolved stage sequence.
    pub fn stages(&self) -> Vec<Stage> {
        let default_timeout = self.default_timeout();
        self.stage_commands
            .iter()
            .map(|s| Stage::resolve(s, default_timeout))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
toolchains = ["stable", "beta", "nightly"]
allow_failures = ["nightly"]
default_timeout_secs = 1200

[retry]
max_attempts = 4
backoff_base_ms = 250

[[setup_commands]]
name = "fetch"
command = "wget https://example.org/libsodium-1.0.18.tar.gz"
fetch = true

[[setup_commands]]
name = "unpack"
command = "tar xvfz libsodium-1.0.18.tar.gz"

[[setup_commands]]
name = "configure"
command = "./configure --prefix=/usr"
dir = "libsodium-1.0.18"

[[stage_commands]]
name = "lint"
command = "cargo clippy"

[[stage_commands]]
name = "test-debug"
command = "cargo test"
timeout_secs = 600
"#;

    #[test]
    fn test_parse_toml_sample() {
        let config = CiConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.toolchains, vec!["stable", "beta", "nightly"]);
        assert_eq!(config.allow_failures, vec!["nightly"]);
        assert_eq!(config.setup_commands.len(), 3);
        assert!(config.setup_commands[0].is_fetch());
        assert!(!config.setup_commands[1].is_fetch());
        assert_eq!(
            config.setup_commands[2].dir.as_deref(),
            Some(Path::new("libsodium-1.0.18"))
        );
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.backoff_base_ms, 250);
        // unspecified retry fields fall back to defaults
        assert_eq!(config.retry.attempt_timeout_secs, 120);
        assert_eq!(config.install, InstallScope::Once);
        assert!(!config.parallel);
        config.validate().unwrap();
    }

    #[test]
    fn test_stages_resolve_timeouts() {
        let config = CiConfig::from_toml_str(SAMPLE).unwrap();
        let stages = config.stages();
        assert_eq!(stages[0].timeout, Duration::from_secs(1200));
        assert_eq!(stages[1].timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_stage_commands_default_to_builtin_sequence() {
        let config = CiConfig::from_toml_str(r#"toolchains = ["stable"]"#).unwrap();
        let names: Vec<_> = config.stage_commands.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["lint", "doc", "build-debug", "test-debug", "test-release", "bench"]
        );
    }

    #[test]
    fn test_missing_toolchains_is_parse_error() {
        let err = CiConfig::from_toml_str(r#"allow_failures = ["beta"]"#).unwrap_err();
        assert!(err.contains("toolchains"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(CiConfig::from_toml_str("toolchains = []\nfoo = 1").is_err());
    }

    #[test]
    fn test_parse_json() {
        let config = CiConfig::from_json_str(
            r#"{"toolchains": ["stable"], "install": "per_variant", "parallel": true}"#,
        )
        .unwrap();
        assert_eq!(config.install, InstallScope::PerVariant);
        assert!(config.parallel);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = CiConfig::new(["stable"]);
        config.default_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = CiConfig::new(["stable"]);
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_step_without_command_or_url() {
        let config = CiConfig::new(["stable"]).with_setup(vec![SetupStep {
            name: "broken".into(),
            ..Default::default()
        }]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_validate_rejects_url_without_dest() {
        let config = CiConfig::new(["stable"]).with_setup(vec![SetupStep {
            name: "fetch".into(),
            url: Some("https://example.org/x.tar.gz".into()),
            ..Default::default()
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_stage_command() {
        let config = CiConfig::new(["stable"]).with_stages(vec![StageConfig::custom("lint", " ")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_empty_matrix() {
        let config = CiConfig::new(Vec::<String>::new());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_resolves_workdir_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix-ci.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "toolchains = [\"stable\"]\nworkdir = \"project\"").unwrap();

        let config = CiConfig::load(&path).unwrap();
        assert_eq!(config.workdir, dir.path().join("project"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = CiConfig::load(Path::new("/no/such/matrix-ci.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_json_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = CiConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("ci.json"));
    }
}
