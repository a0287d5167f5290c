//! Pass/fail classification of a pipeline run.

use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineRun;
use crate::runner::{VariantRun, VariantStatus};

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Green,
    Red,
}

impl Verdict {
    pub fn is_green(&self) -> bool {
        *self == Verdict::Green
    }
}

/// Gate evaluation with human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub verdict: Verdict,

    /// Failures that made the verdict Red (empty if Green).
    pub blocking: Vec<String>,

    /// Failures of allowed-to-fail variants.
    pub advisory: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Failure classification rules.
pub struct FailureClassifier;

impl FailureClassifier {
    /// Reduce a pipeline run to a verdict.
    ///
    /// Red iff the shared setup failed or any variant is `Failed`.
    /// `FailedButAllowed` never reddens the verdict. Side-effect free, so it
    /// can be called on a partially populated run; a Green answer is only
    /// final once every variant is sealed.
    pub fn classify(run: &PipelineRun) -> Verdict {
        if run.install_error.is_some() || Self::classify_variants(&run.variants) == Verdict::Red {
            Verdict::Red
        } else {
            Verdict::Green
        }
    }

    /// Reduce variant runs alone. Order-independent.
    pub fn classify_variants(variants: &[VariantRun]) -> Verdict {
        if variants.iter().any(|v| v.status.is_blocking()) {
            Verdict::Red
        } else {
            Verdict::Green
        }
    }

    /// Classify and explain.
    pub fn evaluate(run: &PipelineRun) -> GateVerdict {
        let mut blocking = Vec::new();
        let mut advisory = Vec::new();

        if let Some(error) = &run.install_error {
            blocking.push(format!("Setup failed, no variants were run: {error}"));
        }

        for variant in &run.variants {
            let Some(stage) = variant.failed_stage() else {
                continue;
            };
            let exit = match stage.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "no exit code".to_string(),
            };
            let line = format!(
                "Toolchain '{}' failed at stage '{}' ({})",
                variant.variant.toolchain, stage.stage_name, exit
            );
            match variant.status {
                VariantStatus::Failed => blocking.push(line),
                VariantStatus::FailedButAllowed => advisory.push(line),
                VariantStatus::Passed => {}
            }
        }

        let verdict = Self::classify(run);
        let message = match verdict {
            Verdict::Green if advisory.is_empty() => "All variants passed".to_string(),
            Verdict::Green => format!("Passed with {} allowed failure(s)", advisory.len()),
            Verdict::Red => format!("Gate failed with {} blocking failure(s)", blocking.len()),
        };

        GateVerdict {
            verdict,
            blocking,
            advisory,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::expand;
    use crate::pipeline::PipelineState;
    use crate::runner::{StageResult, StageStatus};

    fn stage(name: &str, ok: bool) -> StageResult {
        StageResult {
            stage_name: name.to_string(),
            status: if ok {
                StageStatus::Success
            } else {
                StageStatus::Failure
            },
            exit_code: Some(if ok { 0 } else { 101 }),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
        }
    }

    /// Build a run from (toolchain, allowed_to_fail, passed) triples.
    fn run_of(entries: &[(&str, bool, bool)]) -> PipelineRun {
        let ids: Vec<_> = entries.iter().map(|e| e.0).collect();
        let allowed: Vec<_> = entries.iter().filter(|e| e.1).map(|e| e.0).collect();
        let variants = expand(&ids[..], &allowed[..])
            .into_iter()
            .zip(entries)
            .map(|(v, e)| VariantRun::seal(v, vec![stage("lint", true), stage("test", e.2)]))
            .collect();
        let mut run = PipelineRun::new("digest".into());
        run.variants = variants;
        run.state = PipelineState::Sealed;
        run
    }

    #[test]
    fn test_zero_variants_is_green() {
        let run = run_of(&[]);
        assert_eq!(FailureClassifier::classify(&run), Verdict::Green);
    }

    #[test]
    fn test_single_variant() {
        assert!(FailureClassifier::classify(&run_of(&[("stable", false, true)])).is_green());
        assert_eq!(
            FailureClassifier::classify(&run_of(&[("stable", false, false)])),
            Verdict::Red
        );
    }

    #[test]
    fn test_red_iff_any_failed_across_n_variants() {
        // every combination of three variants x (allowed, passed)
        for mask in 0u32..64 {
            let bit = |i: u32| mask & (1 << i) != 0;
            let entries = [
                ("stable", bit(0), bit(1)),
                ("beta", bit(2), bit(3)),
                ("nightly", bit(4), bit(5)),
            ];
            let run = run_of(&entries);
            let any_blocking = entries.iter().any(|(_, allowed, passed)| !allowed && !passed);
            assert_eq!(
                FailureClassifier::classify(&run) == Verdict::Red,
                any_blocking,
                "mask {mask:06b}"
            );
        }
    }

    #[test]
    fn test_allowed_failures_only_is_green() {
        let run = run_of(&[("stable", false, true), ("nightly", true, false), ("beta", true, false)]);
        let gate = FailureClassifier::evaluate(&run);
        assert!(gate.verdict.is_green());
        assert!(gate.blocking.is_empty());
        assert_eq!(gate.advisory.len(), 2);
        assert!(gate.message.contains("2 allowed"));
    }

    #[test]
    fn test_install_failure_is_red_with_no_variants() {
        let mut run = run_of(&[]);
        run.install_error = Some("setup step 'fetch' failed after 3 attempt(s)".into());
        run.state = PipelineState::InstallFailed;
        let gate = FailureClassifier::evaluate(&run);
        assert_eq!(gate.verdict, Verdict::Red);
        assert_eq!(gate.blocking.len(), 1);
        assert!(gate.blocking[0].contains("fetch"));
    }

    #[test]
    fn test_evaluate_names_failing_stage() {
        let run = run_of(&[("stable", false, false)]);
        let gate = FailureClassifier::evaluate(&run);
        assert_eq!(gate.blocking.len(), 1);
        assert!(gate.blocking[0].contains("'stable'"));
        assert!(gate.blocking[0].contains("'test'"));
        assert!(gate.blocking[0].contains("101"));
    }

    #[test]
    fn test_classify_is_order_independent() {
        let a = run_of(&[("stable", false, false), ("beta", true, true)]);
        let b = run_of(&[("beta", true, true), ("stable", false, false)]);
        assert_eq!(FailureClassifier::classify(&a), FailureClassifier::classify(&b));
    }

    #[test]
    fn test_classify_is_repeatable() {
        let run = run_of(&[("stable", false, true)]);
        let first = FailureClassifier::evaluate(&run);
        let second = FailureClassifier::evaluate(&run);
        assert_eq!(first, second);
    }
}
