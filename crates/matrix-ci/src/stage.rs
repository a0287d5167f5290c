//! Verification stage definitions and configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the synthetic stage recorded when setup runs once per variant.
pub const SETUP_STAGE: &str = "setup";

/// Builtin verification stages, in their default order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BuiltinStage {
    /// cargo clippy --all-targets
    Lint,

    /// cargo doc --no-deps
    Doc,

    /// cargo build
    BuildDebug,

    /// cargo test
    TestDebug,

    /// cargo test --release
    TestRelease,

    /// cargo bench
    Bench,
}

impl BuiltinStage {
    /// The default sequence shared by every variant.
    pub const SEQUENCE: [BuiltinStage; 6] = [
        BuiltinStage::Lint,
        BuiltinStage::Doc,
        BuiltinStage::BuildDebug,
        BuiltinStage::TestDebug,
        BuiltinStage::TestRelease,
        BuiltinStage::Bench,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinStage::Lint => "lint",
            BuiltinStage::Doc => "doc",
            BuiltinStage::BuildDebug => "build-debug",
            BuiltinStage::TestDebug => "test-debug",
            BuiltinStage::TestRelease => "test-release",
            BuiltinStage::Bench => "bench",
        }
    }

    /// Get the stage's shell command.
    pub fn command(&self) -> &'static str {
        match self {
            BuiltinStage::Lint => "cargo clippy --all-targets",
            BuiltinStage::Doc => "cargo doc --no-deps",
            BuiltinStage::BuildDebug => "cargo build --verbose",
            BuiltinStage::TestDebug => "cargo test --verbose",
            BuiltinStage::TestRelease => "cargo test --release --verbose",
            BuiltinStage::Bench => "cargo bench --verbose",
        }
    }
}

/// Configuration for a verification stage, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    /// Shell command line. `{toolchain}` is replaced with the variant's toolchain.
    pub command: String,

    /// Timeout in seconds; falls back to the pipeline default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Whether this stage is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StageConfig {
    /// Create a stage configuration from a builtin stage.
    pub fn from_builtin(stage: BuiltinStage) -> Self {
        Self {
            name: stage.name().to_string(),
            command: stage.command().to_string(),
            timeout_secs: None,
            enabled: true,
        }
    }

    /// Create a custom stage configuration.
    pub fn custom(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_secs: None,
            enabled: true,
        }
    }

    /// Set an explicit timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The builtin default sequence.
    pub fn default_sequence() -> Vec<StageConfig> {
        BuiltinStage::SEQUENCE
            .iter()
            .map(|s| StageConfig::from_builtin(*s))
            .collect()
    }
}

/// A resolved stage: immutable once the configuration is loaded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub command: String,
    #[serde(serialize_with = "duration_secs::serialize")]
    pub timeout: Duration,
    pub enabled: bool,
}

impl Stage {
    /// Resolve a stage config against the pipeline's default timeout.
    pub fn resolve(config: &StageConfig, default_timeout: Duration) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            enabled: config.enabled,
        }
    }

    /// Command line with the toolchain placeholder substituted.
    pub fn command_for(&self, toolchain: &str) -> String {
        self.command.replace("{toolchain}", toolchain)
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_stage_names() {
        let names: Vec<_> = BuiltinStage::SEQUENCE.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec!["lint", "doc", "build-debug", "test-debug", "test-release", "bench"]
        );
    }

    #[test]
    fn test_builtin_stage_commands() {
        assert!(BuiltinStage::Lint.command().starts_with("cargo clippy"));
        assert!(BuiltinStage::TestRelease.command().contains("--release"));
        assert!(BuiltinStage::Doc.command().contains("doc"));
    }

    #[test]
    fn test_stage_config_from_builtin() {
        let config = StageConfig::from_builtin(BuiltinStage::BuildDebug);
        assert_eq!(config.name, "build-debug");
        assert!(config.timeout_secs.is_none());
        assert!(config.enabled);
    }

    #[test]
    fn test_stage_config_custom() {
        let config = StageConfig::custom("my_stage", "echo hello").with_timeout(60);
        assert_eq!(config.name, "my_stage");
        assert_eq!(config.timeout_secs, Some(60));
        assert!(config.enabled);
    }

    #[test]
    fn test_stage_config_disabled() {
        let config = StageConfig::from_builtin(BuiltinStage::Bench).disabled();
        assert!(!config.enabled);
    }

    #[test]
    fn test_stage_config_enabled_defaults_true_when_omitted() {
        let config: StageConfig =
            serde_json::from_str(r#"{"name": "lint", "command": "cargo clippy"}"#).unwrap();
        assert!(config.enabled);
    }

    #[test]
    fn test_resolve_uses_default_timeout() {
        let default = Duration::from_secs(900);
        let implicit = Stage::resolve(&StageConfig::custom("a", "true"), default);
        let explicit = Stage::resolve(&StageConfig::custom("b", "true").with_timeout(5), default);
        assert_eq!(implicit.timeout, default);
        assert_eq!(explicit.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_command_for_substitutes_toolchain() {
        let stage = Stage::resolve(
            &StageConfig::custom("build", "cargo +{toolchain} build"),
            Duration::from_secs(1),
        );
        assert_eq!(stage.command_for("nightly"), "cargo +nightly build");
    }
}
