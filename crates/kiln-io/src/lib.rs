//! Filesystem helpers shared by the kiln crates.
//!
//! Metadata and cache writes must never be observable half-done, so every
//! write here goes through a temp file (or temp directory) in the destination
//! parent followed by a rename.

use camino::{Utf8Path, Utf8PathBuf};

/// Atomically replace `path` with `contents`.
///
/// The staging file is created in the destination's parent so the rename
/// never crosses a filesystem boundary. If anything fails before the rename,
/// the staging file is cleaned up on drop and the destination is untouched.
pub fn atomic_write(path: &Utf8Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    std::fs::create_dir_all(parent)?;

    let staged = tempfile::Builder::new()
        .prefix(".stage-")
        .tempfile_in(parent)
        .map_err(std::io::Error::other)?
        .into_temp_path();
    std::fs::write(&staged, contents)?;

    // The rename is the commit point.
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Async wrapper around [`atomic_write`] for callers already on the runtime.
pub async fn atomic_write_async(path: Utf8PathBuf, contents: Vec<u8>) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || atomic_write(&path, &contents))
        .await
        .map_err(std::io::Error::other)?
}

/// Atomically replace the directory at `path` with the directory at `staged`.
///
/// `staged` must live in the same parent as `path`. Any previous directory at
/// `path` is removed first; the rename itself is the commit point.
pub fn commit_dir(staged: &Utf8Path, path: &Utf8Path) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    std::fs::rename(staged, path)
}

/// Remove a file or directory if present, ignoring "not found".
pub fn remove_path_if_exists(path: &Utf8Path) -> std::io::Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
