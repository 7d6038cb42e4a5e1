//! Disk-based OCI image store with LRU eviction.
//!
//! Holds both pulled base images and images produced by the builder, each
//! as an OCI layout under `sha256/<manifest digest>/`. An in-memory index
//! keyed by reference is persisted to `index.json`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_core::error::{Result, StratumError};
use tokio::sync::RwLock;

/// How an image got into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageOrigin {
    Pulled,
    Built,
}

impl fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageOrigin::Pulled => write!(f, "pulled"),
            ImageOrigin::Built => write!(f, "built"),
        }
    }
}

/// Metadata for a stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Full reference, e.g. "docker.io/library/python:3.11-slim"
    pub reference: String,
    /// Manifest digest, "sha256:..."
    pub digest: String,
    pub size_bytes: u64,
    pub origin: ImageOrigin,
    pub stored_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// OCI layout directory
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

pub struct ImageStore {
    store_dir: PathBuf,
    index: Arc<RwLock<BTreeMap<String, StoredImage>>>,
    max_size_bytes: u64,
}

impl ImageStore {
    /// Open the store at `store_dir`, creating it if needed and loading any
    /// persisted index.
    pub fn new(store_dir: &Path, max_size_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            StratumError::OciImageError(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = Self::load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
            max_size_bytes,
        })
    }

    /// Look up an image by reference and mark it used.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        let mut index = self.index.write().await;
        let image = index.get_mut(reference)?;
        image.last_used = Utc::now();
        let updated = image.clone();
        drop(index);
        if let Err(e) = self.save_index().await {
            tracing::warn!(error = %e, "Failed to persist image store index");
        }
        Some(updated)
    }

    pub async fn get_by_digest(&self, digest: &str) -> Option<StoredImage> {
        let index = self.index.read().await;
        index.values().find(|img| img.digest == digest).cloned()
    }

    /// Store the OCI layout in `source_dir` under `reference`.
    ///
    /// Re-tagging a reference to a new digest drops the old layout once no
    /// other reference points at it.
    pub async fn put(
        &self,
        reference: &str,
        digest: &str,
        source_dir: &Path,
        origin: ImageOrigin,
    ) -> Result<StoredImage> {
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let target_dir = self.store_dir.join("sha256").join(digest_hex);

        if !target_dir.exists() {
            let staging = self.store_dir.join("sha256").join(format!("{}.tmp", digest_hex));
            if staging.exists() {
                std::fs::remove_dir_all(&staging)?;
            }
            copy_dir_recursive(source_dir, &staging).map_err(|e| {
                StratumError::OciImageError(format!("Failed to copy image to store: {}", e))
            })?;
            std::fs::rename(&staging, &target_dir)?;
        }

        let now = Utc::now();
        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            size_bytes: dir_size(&target_dir),
            origin,
            stored_at: now,
            last_used: now,
            path: target_dir,
        };

        let mut index = self.index.write().await;
        let replaced = index.insert(reference.to_string(), stored.clone());
        let orphan = replaced.filter(|old| {
            old.digest != stored.digest && !index.values().any(|img| img.digest == old.digest)
        });
        drop(index);

        if let Some(old) = orphan {
            tracing::debug!(reference, old_digest = %old.digest, "Dropping replaced image layout");
            if old.path.exists() {
                std::fs::remove_dir_all(&old.path)?;
            }
        }

        self.save_index().await?;
        tracing::info!(reference, digest, origin = %origin, "Stored image");
        Ok(stored)
    }

    pub async fn remove(&self, reference: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let Some(image) = index.remove(reference) else {
            return Err(StratumError::OciImageError(format!(
                "Image not found in store: {}",
                reference
            )));
        };
        let digest_still_used = index.values().any(|img| img.digest == image.digest);
        drop(index);

        if !digest_still_used && image.path.exists() {
            std::fs::remove_dir_all(&image.path).map_err(|e| {
                StratumError::OciImageError(format!(
                    "Failed to remove image directory {}: {}",
                    image.path.display(),
                    e
                ))
            })?;
        }

        self.save_index().await
    }

    /// All stored images, sorted by reference.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        index.values().cloned().collect()
    }

    /// Evict least-recently-used images until the store fits its limit.
    /// Returns the evicted references.
    pub async fn evict(&self) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        while self.total_size().await > self.max_size_bytes {
            let lru = {
                let index = self.index.read().await;
                index
                    .values()
                    .min_by_key(|img| img.last_used)
                    .map(|img| img.reference.clone())
            };
            let Some(reference) = lru else {
                break;
            };
            self.remove(&reference).await?;
            evicted.push(reference);
        }
        Ok(evicted)
    }

    /// Total size of stored layouts; shared layouts count once.
    pub async fn total_size(&self) -> u64 {
        let index = self.index.read().await;
        let mut by_digest: BTreeMap<&str, u64> = BTreeMap::new();
        for img in index.values() {
            by_digest.insert(img.digest.as_str(), img.size_bytes);
        }
        by_digest.values().sum()
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    fn load_index(store_dir: &Path) -> Result<BTreeMap<String, StoredImage>> {
        let index_path = store_dir.join("index.json");
        if !index_path.exists() {
            return Ok(BTreeMap::new());
        }

        let data = std::fs::read_to_string(&index_path).map_err(|e| {
            StratumError::OciImageError(format!(
                "Failed to read image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
            StratumError::OciImageError(format!("Failed to parse image store index: {}", e))
        })?;

        // Drop entries whose layout was deleted behind our back
        Ok(store_index
            .images
            .into_iter()
            .filter(|img| img.path.exists())
            .map(|img| (img.reference.clone(), img))
            .collect())
    }

    async fn save_index(&self) -> Result<()> {
        let index = self.index.read().await;
        let store_index = StoreIndex {
            images: index.values().cloned().collect(),
        };
        drop(index);

        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.store_dir.join("index.json");
        tokio::fs::write(&index_path, data).await.map_err(|e| {
            StratumError::OciImageError(format!(
                "Failed to write image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = path.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_layout(dir: &Path) {
        std::fs::create_dir_all(dir.join("blobs/sha256")).unwrap();
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        std::fs::write(dir.join("index.json"), r#"{"manifests":[]}"#).unwrap();
        std::fs::write(dir.join("blobs/sha256/testblob"), "x".repeat(1024)).unwrap();
    }

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_layout(&source_dir);
        (tmp, store_dir, source_dir)
    }

    #[tokio::test]
    async fn test_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("images");
        let store = ImageStore::new(&store_dir, 1024 * 1024).unwrap();
        assert!(store_dir.exists());
        assert_eq!(store.total_size().await, 0);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_tmp, store_dir, source_dir) = setup();
        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();

        let stored = store
            .put("telegram-bot:latest", "sha256:abc123", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();
        assert_eq!(stored.reference, "telegram-bot:latest");
        assert_eq!(stored.origin, ImageOrigin::Built);
        assert!(stored.size_bytes > 0);
        assert!(stored.path.join("oci-layout").exists());
        assert!(!store_dir.join("sha256/abc123.tmp").exists());

        let fetched = store.get("telegram-bot:latest").await.unwrap();
        assert_eq!(fetched.digest, "sha256:abc123");

        let fetched = store.get_by_digest("sha256:abc123").await.unwrap();
        assert_eq!(fetched.reference, "telegram-bot:latest");
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path(), 1024 * 1024).unwrap();
        assert!(store.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_retag_drops_orphaned_layout() {
        let (_tmp, store_dir, source_dir) = setup();
        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();

        let first = store
            .put("telegram-bot:latest", "sha256:one", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();
        store
            .put("telegram-bot:latest", "sha256:two", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();

        assert!(!first.path.exists());
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retag_keeps_shared_layout() {
        let (_tmp, store_dir, source_dir) = setup();
        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();

        let first = store
            .put("bot:a", "sha256:one", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();
        store
            .put("bot:b", "sha256:one", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();
        store
            .put("bot:a", "sha256:two", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();

        assert!(first.path.exists());
    }

    #[tokio::test]
    async fn test_remove() {
        let (_tmp, store_dir, source_dir) = setup();
        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
        let stored = store
            .put("python:3.11-slim", "sha256:abc123", &source_dir, ImageOrigin::Pulled)
            .await
            .unwrap();

        store.remove("python:3.11-slim").await.unwrap();
        assert!(store.get("python:3.11-slim").await.is_none());
        assert!(!stored.path.exists());
        assert!(store.remove("python:3.11-slim").await.is_err());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let (_tmp, store_dir, source_dir) = setup();
        let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
        store
            .put("telegram-bot:latest", "sha256:bbb", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();
        store
            .put("python:3.11-slim", "sha256:aaa", &source_dir, ImageOrigin::Pulled)
            .await
            .unwrap();

        let refs: Vec<String> = store.list().await.into_iter().map(|i| i.reference).collect();
        assert_eq!(refs, vec!["python:3.11-slim", "telegram-bot:latest"]);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let (_tmp, store_dir, source_dir) = setup();
        let store = ImageStore::new(&store_dir, 100).unwrap();

        store
            .put("old:v1", "sha256:old1", &source_dir, ImageOrigin::Pulled)
            .await
            .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        store
            .put("new:v2", "sha256:new2", &source_dir, ImageOrigin::Built)
            .await
            .unwrap();
        store.get("new:v2").await;

        let evicted = store.evict().await.unwrap();
        assert_eq!(evicted.first().map(String::as_str), Some("old:v1"));
    }

    #[tokio::test]
    async fn test_index_persistence() {
        let (_tmp, store_dir, source_dir) = setup();
        {
            let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
            store
                .put("python:3.11-slim", "sha256:persist", &source_dir, ImageOrigin::Pulled)
                .await
                .unwrap();
        }
        {
            let store = ImageStore::new(&store_dir, 10 * 1024 * 1024).unwrap();
            let image = store.get("python:3.11-slim").await.unwrap();
            assert_eq!(image.digest, "sha256:persist");
            assert_eq!(image.origin, ImageOrigin::Pulled);
        }
    }
}
