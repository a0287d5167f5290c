//! matrix-ci: toolchain-matrix CI pipeline
//!
//! Runs a fixed stage sequence against every toolchain in a matrix:
//! - Installs dependencies once (or per variant), retrying network fetches
//! - Executes stages in order, stopping a variant at its first failure
//! - Reduces all variants to a single Green/Red verdict

pub mod command;
pub mod config;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod identity;
pub mod installer;
pub mod matrix;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod telemetry;

// Re-export key types
pub use command::{CommandExecutor, CommandOutput, CommandSpec, ShellExecutor};
pub use config::{CiConfig, InstallScope, SetupStep};
pub use error::{ConfigError, InstallError, MatrixCiError, Result};
pub use gate::{FailureClassifier, GateVerdict, Verdict};
pub use installer::{DependencyInstaller, InstallReport};
pub use matrix::{expand, ToolchainVariant};
pub use pipeline::{PipelineController, PipelineRun, PipelineState};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use runner::{StageResult, StageRunner, StageStatus, VariantRun, VariantStatus};
pub use stage::{BuiltinStage, Stage, StageConfig};
pub use telemetry::init_tracing;
