//! Local directory-backed artifact cache.
//!
//! Layout: `<root>/<hex[..2]>/<hex>` for blobs (opaque bytes — ZIP
//! artifacts and gzip manifests alike), with a `<hex>.meta.json` sidecar
//! carrying the out-of-band metadata. Writes go through temp + rename so a
//! concurrent fetch never sees a partial blob.

use std::collections::HashMap;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use kiln_hash::RuleKey;

use crate::{ArtifactCache, ArtifactInfo, CacheResult};

pub struct DirArtifactCache {
    root: Utf8PathBuf,
}

impl DirArtifactCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, key: &RuleKey) -> Utf8PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    fn meta_path(&self, key: &RuleKey) -> Utf8PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(format!("{hex}.meta.json"))
    }

    async fn store_one(
        &self,
        key: &RuleKey,
        metadata: &HashMap<String, String>,
        blob: &Utf8Path,
    ) -> std::io::Result<()> {
        let meta_json = serde_json::to_vec(metadata).map_err(std::io::Error::other)?;
        let contents = tokio::fs::read(blob).await?;
        kiln_io::atomic_write_async(self.blob_path(key), contents).await?;
        kiln_io::atomic_write_async(self.meta_path(key), meta_json).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactCache for DirArtifactCache {
    async fn fetch(&self, key: RuleKey, dest: &Utf8Path) -> CacheResult {
        let blob_path = self.blob_path(&key);
        let metadata = match tokio::fs::read(self.meta_path(&key)).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    return CacheResult::Error {
                        description: format!("corrupt cache metadata for {}: {e}", key.short_hex()),
                    };
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheResult::Miss,
            Err(e) => {
                return CacheResult::Error {
                    description: format!("cache metadata read failed: {e}"),
                };
            }
        };

        match tokio::fs::copy(&blob_path, dest).await {
            Ok(artifact_size) => {
                debug!(key = %key.short_hex(), size = artifact_size, "cache hit");
                CacheResult::Hit {
                    metadata,
                    artifact_size,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheResult::Miss,
            Err(e) => CacheResult::Error {
                description: format!("cache blob read failed: {e}"),
            },
        }
    }

    async fn store(&self, info: ArtifactInfo, blob: Utf8PathBuf) {
        for key in &info.keys {
            if let Err(e) = self.store_one(key, &info.metadata, &blob).await {
                warn!(key = %key.short_hex(), error = %e, "artifact store failed");
            } else {
                debug!(key = %key.short_hex(), "artifact stored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, DirArtifactCache, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let cache = DirArtifactCache::new(root.join("cache"));
        (dir, cache, root)
    }

    #[tokio::test]
    async fn fetch_of_unknown_key_misses() {
        let (_dir, cache, root) = cache();
        let result = cache
            .fetch(RuleKey::from_bytes(b"unknown"), &root.join("out.zip"))
            .await;
        assert!(matches!(result, CacheResult::Miss));
    }

    #[tokio::test]
    async fn store_then_fetch_round_trips() {
        let (_dir, cache, root) = cache();
        let blob = root.join("blob.zip");
        tokio::fs::write(&blob, b"zip bytes").await.unwrap();

        let key = RuleKey::from_bytes(b"the-key");
        let mut metadata = HashMap::new();
        metadata.insert("RULE_KEY".to_string(), key.to_hex());
        cache
            .store(
                ArtifactInfo {
                    keys: vec![key],
                    metadata: metadata.clone(),
                },
                blob,
            )
            .await;

        let dest = root.join("fetched.zip");
        match cache.fetch(key, &dest).await {
            CacheResult::Hit {
                metadata: got,
                artifact_size,
            } => {
                assert_eq!(got, metadata);
                assert_eq!(artifact_size, 9);
            }
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"zip bytes");
    }

    #[tokio::test]
    async fn multi_key_store_indexes_every_key() {
        let (_dir, cache, root) = cache();
        let blob = root.join("blob.zip");
        tokio::fs::write(&blob, b"shared").await.unwrap();

        let k1 = RuleKey::from_bytes(b"default");
        let k2 = RuleKey::from_bytes(b"input-based");
        cache
            .store(
                ArtifactInfo {
                    keys: vec![k1, k2],
                    metadata: HashMap::new(),
                },
                blob,
            )
            .await;

        for key in [k1, k2] {
            let dest = root.join(format!("out-{}.zip", key.short_hex()));
            assert!(cache.fetch(key, &dest).await.is_hit());
        }
    }
}
