//! The artifact cache contract.
//!
//! The engine treats every cache as potentially remote and best-effort:
//! fetches that error degrade to misses, stores never fail a build, and one
//! blob may be indexed under several keys. Transports beyond the local
//! directory implementation live outside the core.

mod dir;

pub use dir::DirArtifactCache;

use std::collections::HashMap;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use kiln_hash::RuleKey;

/// Keys and out-of-band metadata accompanying a stored blob.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    /// Every key the blob should be retrievable under.
    pub keys: Vec<RuleKey>,
    pub metadata: HashMap<String, String>,
}

/// Outcome of a cache interaction.
#[derive(Debug, Clone)]
pub enum CacheResult {
    /// The blob was written to the requested destination.
    Hit {
        metadata: HashMap<String, String>,
        artifact_size: u64,
    },
    /// No fetch happened: the on-disk key already matched.
    LocalKeyUnchangedHit,
    Miss,
    /// The rule is not cacheable; the cache was never consulted.
    Ignored,
    /// Transport-level failure. Never fatal; the engine logs and treats it
    /// as a miss.
    Error { description: String },
}

impl CacheResult {
    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            CacheResult::Hit { .. } | CacheResult::LocalKeyUnchangedHit
        )
    }
}

/// Narrow fetch/store contract the engine depends on.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Fetch the blob for `key` into `dest`.
    async fn fetch(&self, key: RuleKey, dest: &Utf8Path) -> CacheResult;

    /// Store `blob` under every key in `info`. Best-effort: implementations
    /// log failures and return.
    async fn store(&self, info: ArtifactInfo, blob: Utf8PathBuf);
}

/// A cache that never hits and never stores. Stands in when caching is
/// disabled entirely.
pub struct NoopArtifactCache;

#[async_trait]
impl ArtifactCache for NoopArtifactCache {
    async fn fetch(&self, _key: RuleKey, _dest: &Utf8Path) -> CacheResult {
        CacheResult::Miss
    }

    async fn store(&self, _info: ArtifactInfo, _blob: Utf8PathBuf) {}
}
