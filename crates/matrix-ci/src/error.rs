//! Error types for matrix-ci.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed or missing configuration. Raised before any command runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure of the shared dependency setup procedure.
#[derive(Error, Debug)]
pub enum InstallError {
    /// Transient fetch failure that outlived the retry bound.
    #[error("setup step '{step}' failed after {attempts} attempt(s): {reason}")]
    Network {
        step: String,
        attempts: u32,
        reason: String,
    },

    /// Non-zero exit (or timeout) of a step that is not retried.
    #[error("setup step '{step}' failed{}: {reason}", exit_suffix(.exit_code))]
    StepFailed {
        step: String,
        exit_code: Option<i32>,
        reason: String,
    },

    /// Deterministic fetch failure, e.g. a 404 or an unwritable destination.
    #[error("setup step '{step}' fetch rejected: {reason}")]
    FetchRejected { step: String, reason: String },

    #[error("setup step '{step}' could not be started: {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl InstallError {
    /// Name of the setup step that failed.
    pub fn step(&self) -> &str {
        match self {
            InstallError::Network { step, .. }
            | InstallError::StepFailed { step, .. }
            | InstallError::FetchRejected { step, .. }
            | InstallError::Spawn { step, .. } => step,
        }
    }

    /// Whether this failure came from an exhausted network retry loop.
    pub fn is_network(&self) -> bool {
        matches!(self, InstallError::Network { .. })
    }
}

/// Top-level error for matrix-ci operations.
#[derive(Error, Debug)]
pub enum MatrixCiError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MatrixCiError {
    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            MatrixCiError::Config(_) => crate::pipeline::EXIT_CONFIG_ERROR,
            MatrixCiError::Install(_) => crate::pipeline::EXIT_INSTALL_FAILED,
            MatrixCiError::Io(_) | MatrixCiError::Json(_) => crate::pipeline::EXIT_INTERNAL,
        }
    }
}

/// Result type for matrix-ci operations.
pub type Result<T> = std::result::Result<T, MatrixCiError>;
