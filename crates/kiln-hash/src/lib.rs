//! Digest types and the memoized file hash cache.
//!
//! Everything in kiln that names content — rule keys, file contents, manifest
//! entries — is a 160-bit digest derived from blake3. The width is fixed by
//! the manifest wire format (20-byte hashes), so blake3 output is truncated
//! rather than carried at full width.

use camino::{Utf8Path, Utf8PathBuf};

mod file_hash_cache;

pub use file_hash_cache::{DefaultFileHashCache, FileHashCache, StackedFileHashCache};

/// Number of bytes in a [`Digest`].
pub const DIGEST_LEN: usize = 20;

/// A 160-bit digest: blake3, truncated to 20 bytes.
///
/// Raw bytes internally; hex formatting is for display and on-disk metadata
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; DIGEST_LEN]);

/// A rule key under one of the four notions of "sameness" (default,
/// input-based, dep-file, manifest). All four share the representation.
pub type RuleKey = Digest;

/// Hash of a file's contents.
pub type ContentHash = Digest;

impl Digest {
    /// Hash raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_blake3(blake3::hash(bytes))
    }

    /// Truncate a finalized blake3 hash.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hash.as_bytes()[..DIGEST_LEN]);
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(DIGEST_LEN * 2);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// First 16 hex chars (8 bytes) for display.
    pub fn short_hex(&self) -> String {
        self.to_hex()[..16].to_string()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != DIGEST_LEN * 2 {
            return None;
        }
        let mut out = [0u8; DIGEST_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(hex_str, 16).ok()?;
        }
        Some(Self(out))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash a file's contents on disk.
pub fn hash_file(path: &Utf8Path) -> std::io::Result<ContentHash> {
    let contents = std::fs::read(path)?;
    Ok(Digest::from_bytes(&contents))
}

/// The project root against which project-relative paths resolve.
///
/// All paths exchanged between kiln components are project-relative; only the
/// filesystem boundary (hashing, archiving, step execution) resolves them.
#[derive(Debug, Clone)]
pub struct ProjectFilesystem {
    root: Utf8PathBuf,
}

impl ProjectFilesystem {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Resolve a project-relative path to an absolute one.
    pub fn resolve(&self, rel: &Utf8Path) -> Utf8PathBuf {
        self.root.join(rel)
    }

    pub fn exists(&self, rel: &Utf8Path) -> bool {
        self.resolve(rel).exists()
    }
}
