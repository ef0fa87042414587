//! Memoized path → content-hash lookup.
//!
//! The first `get` for a path hashes the file; later calls return the cached
//! value until the engine invalidates the path. The engine guarantees that
//! any operation mutating a path calls `invalidate` before the next `get`.

use std::collections::HashMap;
use std::sync::RwLock;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::trace;

use crate::{hash_file, ContentHash, ProjectFilesystem};

/// Contract for a path → content-hash cache.
///
/// Paths are project-relative. Implementations may be stacked per filesystem;
/// see [`StackedFileHashCache`].
pub trait FileHashCache: Send + Sync {
    /// Hash of the file at `path`, computing and memoizing it on first call.
    fn get(&self, path: &Utf8Path) -> std::io::Result<ContentHash>;

    /// Seed the cache with a known hash (e.g. verified from fetched metadata).
    fn set(&self, path: Utf8PathBuf, hash: ContentHash);

    /// Drop any cached hash for `path`.
    fn invalidate(&self, path: &Utf8Path);

    /// Whether this cache is responsible for `path`.
    fn covers(&self, path: &Utf8Path) -> bool;
}

/// Hash cache for a single project filesystem.
///
/// Readers overlap freely; writers take the lock only long enough to insert.
pub struct DefaultFileHashCache {
    fs: ProjectFilesystem,
    hashes: RwLock<HashMap<Utf8PathBuf, ContentHash>>,
}

impl DefaultFileHashCache {
    pub fn new(fs: ProjectFilesystem) -> Self {
        Self {
            fs,
            hashes: RwLock::new(HashMap::new()),
        }
    }

    pub fn filesystem(&self) -> &ProjectFilesystem {
        &self.fs
    }
}

impl FileHashCache for DefaultFileHashCache {
    fn get(&self, path: &Utf8Path) -> std::io::Result<ContentHash> {
        if let Some(hash) = self.hashes.read().unwrap().get(path) {
            return Ok(*hash);
        }

        let hash = hash_file(&self.fs.resolve(path))?;
        trace!(path = %path, hash = %hash.short_hex(), "hashed file");
        self.hashes.write().unwrap().insert(path.to_owned(), hash);
        Ok(hash)
    }

    fn set(&self, path: Utf8PathBuf, hash: ContentHash) {
        self.hashes.write().unwrap().insert(path, hash);
    }

    fn invalidate(&self, path: &Utf8Path) {
        self.hashes.write().unwrap().remove(path);
    }

    fn covers(&self, _path: &Utf8Path) -> bool {
        true
    }
}

/// Layered hash caches consulted in order.
///
/// `get` asks the first covering layer; `set` and `invalidate` are applied to
/// every covering layer so no layer retains a stale entry.
pub struct StackedFileHashCache {
    layers: Vec<std::sync::Arc<dyn FileHashCache>>,
}

impl StackedFileHashCache {
    pub fn new(layers: Vec<std::sync::Arc<dyn FileHashCache>>) -> Self {
        Self { layers }
    }
}

impl FileHashCache for StackedFileHashCache {
    fn get(&self, path: &Utf8Path) -> std::io::Result<ContentHash> {
        for layer in &self.layers {
            if layer.covers(path) {
                return layer.get(path);
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no hash cache layer covers {path}"),
        ))
    }

    fn set(&self, path: Utf8PathBuf, hash: ContentHash) {
        for layer in &self.layers {
            if layer.covers(&path) {
                layer.set(path.clone(), hash);
            }
        }
    }

    fn invalidate(&self, path: &Utf8Path) {
        for layer in &self.layers {
            if layer.covers(path) {
                layer.invalidate(path);
            }
        }
    }

    fn covers(&self, path: &Utf8Path) -> bool {
        self.layers.iter().any(|l| l.covers(path))
    }
}
