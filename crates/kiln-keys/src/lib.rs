//! Rule-key computation.
//!
//! All four key variants (default, input-based, dep-file, manifest) share one
//! canonical serializer: a tagged hash sponge over blake3. Two rules with
//! identical logical key inputs always get bit-identical keys; there is no
//! per-rule salt. A process-wide seed is folded into every key so a fleet can
//! invalidate everything at once.

mod factory;
mod hasher;

pub use factory::{ManifestKeyAndInputs, MissingInputBehavior, RuleKeyFactory};
pub use hasher::KeyHasher;

use std::sync::Arc;

use camino::Utf8PathBuf;
use kiln_rule::BuildTarget;
use thiserror::Error;

/// Errors during key computation. Control-flow conditions (size limit,
/// missing inputs) are explicit variants the engine branches on.
#[derive(Debug, Clone, Error)]
pub enum KeyError {
    #[error("input-based key for {target} exceeds size limit ({actual} > {limit} bytes)")]
    SizeLimitExceeded {
        target: BuildTarget,
        limit: u64,
        actual: u64,
    },

    #[error("dep-file input `{path}` for {target} no longer exists")]
    MissingInput {
        target: BuildTarget,
        path: Utf8PathBuf,
    },

    #[error("i/o error hashing `{path}`: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}
