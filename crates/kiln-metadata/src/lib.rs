//! The on-disk build-info store.
//!
//! One directory per target under the store root; each metadata key is a
//! file whose contents are the UTF-8 value. `RECORDED_PATHS`,
//! `RECORDED_PATH_HASHES`, and `DEP_FILE` values are JSON documents.
//!
//! Updates are all-or-none: the full key set is staged into a fresh sibling
//! directory which then replaces the live `.metadata` directory in one
//! rename. Readers concurrent with an update see either the old complete set
//! or the new one, never a mix. Per-target writes are serialized by the
//! engine (a rule has at most one build in flight).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use kiln_rule::BuildTarget;

/// Fixed metadata keys.
pub mod keys {
    pub const TARGET: &str = "TARGET";
    pub const RULE_KEY: &str = "RULE_KEY";
    pub const INPUT_BASED_RULE_KEY: &str = "INPUT_BASED_RULE_KEY";
    pub const DEP_FILE_RULE_KEY: &str = "DEP_FILE_RULE_KEY";
    pub const MANIFEST_KEY: &str = "MANIFEST_KEY";
    /// JSON list of project-relative output paths.
    pub const RECORDED_PATHS: &str = "RECORDED_PATHS";
    /// JSON map of output path → hex content hash.
    pub const RECORDED_PATH_HASHES: &str = "RECORDED_PATH_HASHES";
    /// JSON list of input descriptors observed by the last local build.
    pub const DEP_FILE: &str = "DEP_FILE";
}

const METADATA_DIR: &str = ".metadata";
const MANIFEST_FILE: &str = "dep_file_manifest.bin";

/// Per-filesystem store of per-target build metadata.
pub struct BuildInfoStore {
    root: Utf8PathBuf,
}

impl BuildInfoStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn target_dir(&self, target: &BuildTarget) -> Utf8PathBuf {
        self.root.join(target.short_path())
    }

    fn metadata_dir(&self, target: &BuildTarget) -> Utf8PathBuf {
        self.target_dir(target).join(METADATA_DIR)
    }

    /// Where the dep-file manifest for `target` persists. Lives outside the
    /// `.metadata` directory so metadata swaps leave it in place.
    pub fn manifest_path(&self, target: &BuildTarget) -> Utf8PathBuf {
        self.target_dir(target).join(MANIFEST_FILE)
    }

    /// Read a single metadata value. `None` when the key (or the whole
    /// target) has never been written.
    pub fn read(&self, target: &BuildTarget, key: &str) -> std::io::Result<Option<String>> {
        let path = self.metadata_dir(target).join(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read the complete metadata set for a target.
    pub fn read_all(&self, target: &BuildTarget) -> std::io::Result<HashMap<String, String>> {
        let dir = self.metadata_dir(target);
        let mut out = HashMap::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let value = std::fs::read_to_string(entry.path())?;
            out.insert(name, value);
        }
        Ok(out)
    }

    /// Replace the target's metadata set atomically: stage every key into a
    /// temp directory in the same parent, then swap directories.
    pub fn update(
        &self,
        target: &BuildTarget,
        metadata: &HashMap<String, String>,
    ) -> std::io::Result<()> {
        let target_dir = self.target_dir(target);
        std::fs::create_dir_all(&target_dir)?;

        let staged = tempfile::Builder::new()
            .prefix(".metadata.tmp-")
            .tempdir_in(&target_dir)
            .map_err(std::io::Error::other)?;
        let staged_path = Utf8PathBuf::from_path_buf(staged.path().to_owned())
            .map_err(|p| std::io::Error::other(format!("non-UTF8 temp dir {}", p.display())))?;

        for (key, value) in metadata {
            std::fs::write(staged_path.join(key), value)?;
        }

        kiln_io::commit_dir(&staged_path, &self.metadata_dir(target))?;
        // The staged dir was renamed away; don't let TempDir try to delete it.
        std::mem::forget(staged);

        debug!(rule = %target, keys = metadata.len(), "metadata committed");
        Ok(())
    }

    /// Remove all metadata for a target. Used to clear prior state before
    /// unpacking a fetched artifact and to clean up after a failed build.
    pub fn delete(&self, target: &BuildTarget) -> std::io::Result<()> {
        kiln_io::remove_path_if_exists(&self.metadata_dir(target))
    }
}

/// Registry handing out one [`BuildInfoStore`] per filesystem root.
#[derive(Default)]
pub struct BuildInfoStores {
    stores: Mutex<HashMap<Utf8PathBuf, Arc<BuildInfoStore>>>,
}

impl BuildInfoStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, root: &Utf8Path) -> Arc<BuildInfoStore> {
        let mut stores = self.stores.lock().unwrap();
        stores
            .entry(root.to_owned())
            .or_insert_with(|| Arc::new(BuildInfoStore::new(root.to_owned())))
            .clone()
    }
}
