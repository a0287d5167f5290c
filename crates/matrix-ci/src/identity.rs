//! Run identity: a stable digest of the configuration that produced a run.

use sha2::{Digest, Sha256};

use crate::config::CiConfig;
use crate::error::Result;

/// SHA-256 of the canonical JSON form of `config`.
///
/// Equal configurations digest equally; reordering toolchains or stages
/// changes the digest.
pub fn config_digest(config: &CiConfig) -> Result<String> {
    // Struct fields serialize in declaration order and maps are BTreeMaps,
    // so the JSON form is canonical.
    let canonical = serde_json::to_vec(config)?;
    Ok(compute_digest(&canonical))
}

/// Deterministic digest of an ordered list of names.
pub fn names_digest<S: AsRef<str>>(names: &[S]) -> String {
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name.as_ref().as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
