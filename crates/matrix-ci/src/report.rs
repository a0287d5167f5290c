//! Human-readable and JSON rendering of a pipeline run.

use std::fmt::Write as _;

use crate::gate::GateVerdict;
use crate::matrix::ToolchainVariant;
use crate::pipeline::PipelineRun;
use crate::runner::{StageStatus, VariantStatus};
use crate::stage::Stage;

/// Lines of stderr shown for a failing stage.
pub const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Per-variant, per-stage status log.
///
/// Every variant is listed even when the verdict is Red, and the failing
/// stage's stderr tail is always included.
pub fn render_text(run: &PipelineRun, gate: &GateVerdict) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run ID: {}", run.run_id);
    let _ = writeln!(out, "Config: {}", &run.config_digest[..12.min(run.config_digest.len())]);

    if let Some(install) = &run.install {
        let _ = writeln!(
            out,
            "Setup: ✓ {} step(s), {} fetch attempt(s)",
            install.steps.len(),
            install.fetch_attempts()
        );
    }
    if let Some(error) = &run.install_error {
        let _ = writeln!(out, "Setup: ✗ {error}");
        let _ = writeln!(out, "No variants were run.");
    }

    for variant in &run.variants {
        let _ = writeln!(out);
        let status = match variant.status {
            VariantStatus::Passed => "✓ PASSED",
            VariantStatus::Failed => "✗ FAILED",
            VariantStatus::FailedButAllowed => "✗ FAILED (allowed)",
        };
        let allowed = if variant.variant.allowed_to_fail {
            " [allowed to fail]"
        } else {
            ""
        };
        let _ = writeln!(out, "{}{}: {}", variant.variant.toolchain, allowed, status);

        for stage in &variant.stages {
            let mark = match stage.status {
                StageStatus::Success => "✓",
                StageStatus::Failure => "✗",
                StageStatus::Skipped => "-",
            };
            match (stage.status, stage.exit_code) {
                (StageStatus::Skipped, _) => {
                    let _ = writeln!(out, "  {} {} (skipped)", mark, stage.stage_name);
                }
                (_, Some(code)) => {
                    let _ = writeln!(
                        out,
                        "  {} {} ({}ms, exit code: {})",
                        mark, stage.stage_name, stage.duration_ms, code
                    );
                }
                (_, None) => {
                    let _ = writeln!(
                        out,
                        "  {} {} ({}ms, no exit code)",
                        mark, stage.stage_name, stage.duration_ms
                    );
                }
            }
        }

        if let Some(failed) = variant.failed_stage() {
            let tail = tail_lines(&failed.stderr, DIAGNOSTIC_TAIL_LINES);
            if !tail.is_empty() {
                let _ = writeln!(out, "  --- {} stderr ---", failed.stage_name);
                for line in tail {
                    let _ = writeln!(out, "  | {line}");
                }
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Summary: {} passed, {} failed, {} allowed failure(s)",
        run.count(VariantStatus::Passed),
        run.count(VariantStatus::Failed),
        run.count(VariantStatus::FailedButAllowed)
    );
    if let Some(ms) = run.duration_ms() {
        let _ = writeln!(out, "Duration: {ms}ms");
    }
    for line in &gate.blocking {
        let _ = writeln!(out, "  - {line}");
    }
    for line in &gate.advisory {
        let _ = writeln!(out, "  ~ {line}");
    }
    let verdict = if gate.verdict.is_green() {
        "✓ GREEN"
    } else {
        "✗ RED"
    };
    let _ = writeln!(out, "Verdict: {} ({})", verdict, gate.message);
    out
}

/// Machine-readable report.
pub fn render_json(run: &PipelineRun, gate: &GateVerdict) -> serde_json::Value {
    serde_json::json!({
        "run": run,
        "gate": gate,
        "exit_code": run.exit_code(),
    })
}

/// Expanded matrix and stage sequence, without running anything.
pub fn render_plan(variants: &[ToolchainVariant], stages: &[Stage]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Matrix: {} variant(s)", variants.len());
    for v in variants {
        let _ = writeln!(
            out,
            "  [{}] {}{}",
            v.index,
            v.toolchain,
            if v.allowed_to_fail { " (allowed to fail)" } else { "" }
        );
    }
    let _ = writeln!(out, "Stages:");
    for (i, s) in stages.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {}. {} `{}` (timeout {}s){}",
            i + 1,
            s.name,
            s.command,
            s.timeout.as_secs(),
            if s.enabled { "" } else { " [disabled]" }
        );
    }
    out
}

fn tail_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}
