//! The dep-file manifest store.
//!
//! A manifest maps observed-input fingerprints to dep-file rule keys for one
//! manifest key. It is append-only in memory and persisted in a stable
//! binary form (GZIP-compressed on the wire to the artifact cache):
//!
//! ```text
//! u32   entry count
//! per entry:
//!   u32   input count
//!   per input: u16 path length, path bytes, 20-byte content hash
//!   20-byte dep-file rule key
//! ```
//!
//! Integers are little-endian. Only a successful local build appends, and
//! the engine serializes appends per manifest key, so readers never race a
//! writer on the same manifest.

use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

use kiln_hash::{ContentHash, FileHashCache, RuleKey, DIGEST_LEN};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt manifest: {0}")]
    Corrupt(String),
}

/// One observed-input fingerprint and the dep-file key it proves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// `(path, content hash)` for every input the build actually consumed,
    /// sorted by path.
    pub inputs: Vec<(Utf8PathBuf, ContentHash)>,
    pub key: RuleKey,
}

/// In-memory manifest for a single manifest key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Find the dep-file key proven by the current file state.
    ///
    /// Entries are scanned in insertion order; the first whose recorded
    /// hashes all match the current hashes of its covered subset wins. A
    /// recorded input that is missing or unreadable disqualifies the entry.
    pub fn lookup(&self, cache: &dyn FileHashCache) -> Option<RuleKey> {
        'entries: for entry in &self.entries {
            for (path, recorded) in &entry.inputs {
                match cache.get(path) {
                    Ok(current) if current == *recorded => {}
                    _ => continue 'entries,
                }
            }
            return Some(entry.key);
        }
        None
    }

    /// Record a fresh `(observed inputs → dep-file key)` entry.
    ///
    /// If the manifest is already at `max_entries`, it is reset to empty
    /// before the add; a small bound plus occasional rebuild beats an
    /// unbounded scan.
    pub fn add_entry(
        &mut self,
        cache: &dyn FileHashCache,
        key: RuleKey,
        observed: &[Utf8PathBuf],
        max_entries: usize,
    ) -> std::io::Result<()> {
        if self.entries.len() >= max_entries {
            debug!(
                entries = self.entries.len(),
                max_entries, "manifest overflow; resetting"
            );
            self.entries.clear();
        }

        let mut inputs = Vec::with_capacity(observed.len());
        for path in observed {
            inputs.push((path.clone(), cache.get(path)?));
        }
        inputs.sort_by(|a, b| a.0.cmp(&b.0));

        self.entries.push(ManifestEntry { inputs, key });
        Ok(())
    }

    pub fn serialize(&self, sink: &mut impl Write) -> std::io::Result<()> {
        sink.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for entry in &self.entries {
            sink.write_all(&(entry.inputs.len() as u32).to_le_bytes())?;
            for (path, hash) in &entry.inputs {
                let bytes = path.as_str().as_bytes();
                sink.write_all(&(bytes.len() as u16).to_le_bytes())?;
                sink.write_all(bytes)?;
                sink.write_all(&hash.0)?;
            }
            sink.write_all(&entry.key.0)?;
        }
        Ok(())
    }

    pub fn deserialize(source: &mut impl Read) -> Result<Self, ManifestError> {
        let entry_count = read_u32(source)?;
        let mut entries = Vec::new();
        for _ in 0..entry_count {
            let input_count = read_u32(source)?;
            let mut inputs = Vec::new();
            for _ in 0..input_count {
                let path_len = read_u16(source)? as usize;
                let mut path_bytes = vec![0u8; path_len];
                source.read_exact(&mut path_bytes)?;
                let path = String::from_utf8(path_bytes)
                    .map_err(|_| ManifestError::Corrupt("non-UTF8 path".to_string()))?;
                inputs.push((Utf8PathBuf::from(path), read_digest(source)?));
            }
            entries.push(ManifestEntry {
                inputs,
                key: read_digest(source)?,
            });
        }
        Ok(Self { entries })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // Writing to a Vec cannot fail.
        self.serialize(&mut out).unwrap();
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        Self::deserialize(&mut std::io::Cursor::new(bytes))
    }

    /// Load a manifest from disk; `Ok(None)` when the file does not exist.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>, ManifestError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(Self::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_u32(source: &mut impl Read) -> Result<u32, ManifestError> {
    let mut buf = [0u8; 4];
    source.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u16(source: &mut impl Read) -> Result<u16, ManifestError> {
    let mut buf = [0u8; 2];
    source.read_exact(&mut buf).map_err(truncated)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_digest(source: &mut impl Read) -> Result<ContentHash, ManifestError> {
    let mut buf = [0u8; DIGEST_LEN];
    source.read_exact(&mut buf).map_err(truncated)?;
    Ok(kiln_hash::Digest(buf))
}

fn truncated(e: std::io::Error) -> ManifestError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ManifestError::Corrupt("truncated manifest".to_string())
    } else {
        ManifestError::Io(e)
    }
}
