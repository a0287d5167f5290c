//! matrix-ci - toolchain-matrix CI runner
//!
//! ## Commands
//!
//! - `run`: install dependencies, run every stage for every toolchain, gate
//! - `plan`: print the expanded matrix and stage sequence
//! - `validate`: check a config file without running anything

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};

use matrix_ci::pipeline::{EXIT_CONFIG_ERROR, EXIT_GREEN, EXIT_INTERNAL};
use matrix_ci::{
    expand, report, CiConfig, ConfigError, FailureClassifier, MatrixCiError, PipelineController,
};

#[derive(Parser, Debug)]
#[command(name = "matrix-ci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a CI stage sequence across a toolchain matrix", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline and exit with the gate's verdict
    Run {
        /// Pipeline config (TOML, or JSON with a .json extension)
        #[arg(short, long, env = "MATRIX_CI_CONFIG")]
        config: PathBuf,

        /// Run toolchain variants concurrently
        #[arg(long)]
        parallel: bool,

        /// Override the fetch retry bound
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Write the JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show the expanded matrix and stages without executing anything
    Plan {
        #[arg(short, long, env = "MATRIX_CI_CONFIG")]
        config: PathBuf,
    },

    /// Validate a config file
    Validate {
        #[arg(short, long, env = "MATRIX_CI_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    matrix_ci::init_tracing(cli.json, level);

    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            config,
            parallel,
            max_attempts,
            report,
        } => cmd_run(&config, parallel, max_attempts, report.as_deref()).await,
        Commands::Plan { config } => cmd_plan(&config),
        Commands::Validate { config } => cmd_validate(&config),
    }
}

/// Map an error escaping a command to its process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<MatrixCiError>() {
        e.exit_code()
    } else if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_INTERNAL
    }
}

fn load_config(
    path: &Path,
    parallel: bool,
    max_attempts: Option<u32>,
) -> std::result::Result<CiConfig, ConfigError> {
    let mut config = CiConfig::load(path)?;
    if parallel {
        config.parallel = true;
    }
    if let Some(n) = max_attempts {
        config.retry.max_attempts = n;
        config.validate()?;
    }
    Ok(config)
}

async fn cmd_run(
    config_path: &Path,
    parallel: bool,
    max_attempts: Option<u32>,
    report_path: Option<&Path>,
) -> Result<i32> {
    let config = load_config(config_path, parallel, max_attempts)?;
    info!(config = %config_path.display(), "loaded config");

    let mut controller = PipelineController::with_shell(config);
    let run = controller.run().await?;
    let gate = FailureClassifier::evaluate(&run);

    print!("{}", report::render_text(&run, &gate));

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report::render_json(&run, &gate))
            .map_err(MatrixCiError::from)?;
        std::fs::write(path, json)
            .map_err(MatrixCiError::from)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "wrote run report");
    }

    Ok(run.exit_code())
}

fn cmd_plan(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path, false, None)?;
    let variants = expand(&config.toolchains, &config.allow_failures);
    println!("Config: {}", config_path.display());
    println!("Workdir: {}", config.workdir.display());
    println!(
        "Setup: {} step(s), {:?}",
        config.setup_commands.len(),
        config.install
    );
    print!("{}", report::render_plan(&variants, &config.stages()));
    Ok(EXIT_GREEN)
}

fn cmd_validate(config_path: &Path) -> Result<i32> {
    let config = load_config(config_path, false, None)?;
    println!(
        "✓ {} is valid ({} toolchain(s), {} stage(s))",
        config_path.display(),
        config.toolchains.len(),
        config.stage_commands.len()
    );
    Ok(EXIT_GREEN)
}
