//! Toolchain matrix expansion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment variable carrying the variant's toolchain to every command.
pub const TOOLCHAIN_ENV: &str = "MATRIX_CI_TOOLCHAIN";

/// One matrix entry. Immutable once expanded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolchainVariant {
    /// Position in the declared toolchain list.
    pub index: usize,

    /// Toolchain identifier, e.g. `stable` or `nightly-2024-01-01`.
    pub toolchain: String,

    /// Whether a failure of this variant is advisory.
    pub allowed_to_fail: bool,
}

impl ToolchainVariant {
    /// Environment handed to every command run for this variant.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(TOOLCHAIN_ENV.to_string(), self.toolchain.clone());
        env.insert("RUSTUP_TOOLCHAIN".to_string(), self.toolchain.clone());
        env
    }
}

/// Expand the declared toolchains into one variant per entry.
///
/// Declared order is kept and duplicates are not collapsed: `[stable, beta,
/// stable]` yields three variants.
pub fn expand<S: AsRef<str>>(toolchains: &[S], allow_failures: &[S]) -> Vec<ToolchainVariant> {
    toolchains
        .iter()
        .enumerate()
        .map(|(index, id)| ToolchainVariant {
            index,
            toolchain: id.as_ref().to_string(),
            allowed_to_fail: allow_failures.iter().any(|a| a.as_ref() == id.as_ref()),
        })
        .collect()
}
