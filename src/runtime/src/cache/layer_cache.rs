//! Stage layer cache.
//!
//! Maps a build stage key (a chained SHA256 over everything the stage
//! depends on) to the layer tarball that stage produced. A hit lets the
//! build engine apply the cached layer instead of executing the step.
//!
//! Layout under `cache_dir`: `<key>.tar.gz` plus `<key>.meta.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stratum_core::error::{Result, StratumError};

use crate::oci::build::layer::LayerInfo;

/// Metadata for a cached stage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerMeta {
    /// Stage key (hex)
    pub key: String,
    /// Compressed layer digest (hex)
    pub digest: String,
    /// Uncompressed layer digest (hex)
    pub diff_id: String,
    /// Compressed size in bytes
    pub size_bytes: u64,
    /// Instruction that produced the layer
    pub created_by: String,
    /// When the layer was cached (Unix millis)
    pub cached_at: i64,
    /// Last cache hit (Unix millis)
    pub last_accessed: i64,
}

/// A cache hit: where the layer lives and what it is.
#[derive(Debug, Clone)]
pub struct CachedLayer {
    pub path: PathBuf,
    pub meta: LayerMeta,
}

impl CachedLayer {
    pub fn layer_info(&self) -> LayerInfo {
        LayerInfo {
            path: self.path.clone(),
            digest: self.meta.digest.clone(),
            diff_id: self.meta.diff_id.clone(),
            size: self.meta.size_bytes,
        }
    }
}

/// Stage-keyed layer cache on disk.
pub struct LayerCache {
    cache_dir: PathBuf,
}

impl LayerCache {
    /// Open (creating if needed) a cache rooted at `cache_dir`.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            StratumError::CacheError(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Look up a stage key.
    ///
    /// An entry whose tarball is missing or whose size disagrees with its
    /// metadata is dropped and reported as a miss.
    pub fn get(&self, key: &str) -> Result<Option<CachedLayer>> {
        let (layer_path, meta_path) = self.entry_paths(key)?;
        if !meta_path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&meta_path)?;
        let mut meta = match serde_json::from_str::<LayerMeta>(&content) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unreadable cache metadata");
                self.invalidate(key)?;
                return Ok(None);
            }
        };

        let actual_size = std::fs::metadata(&layer_path).map(|m| m.len()).ok();
        if actual_size != Some(meta.size_bytes) {
            tracing::warn!(key, "Discarding incomplete cache entry");
            self.invalidate(key)?;
            return Ok(None);
        }

        meta.last_accessed = chrono::Utc::now().timestamp_millis();
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;

        Ok(Some(CachedLayer {
            path: layer_path,
            meta,
        }))
    }

    /// Store the layer produced for `key`, replacing any previous entry.
    pub fn put(&self, key: &str, layer: &LayerInfo, created_by: &str) -> Result<CachedLayer> {
        let (layer_path, meta_path) = self.entry_paths(key)?;

        // Copy under a temporary name first so a crash never leaves a
        // truncated tarball under the real key.
        let tmp_path = self.cache_dir.join(format!("{}.tar.gz.tmp", key));
        std::fs::copy(&layer.path, &tmp_path).map_err(|e| {
            StratumError::CacheError(format!(
                "Failed to copy layer {} into cache: {}",
                layer.path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &layer_path)?;

        let now = chrono::Utc::now().timestamp_millis();
        let meta = LayerMeta {
            key: key.to_string(),
            digest: layer.digest.clone(),
            diff_id: layer.diff_id.clone(),
            size_bytes: layer.size,
            created_by: created_by.to_string(),
            cached_at: now,
            last_accessed: now,
        };
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?).map_err(|e| {
            StratumError::CacheError(format!(
                "Failed to write layer metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;

        tracing::debug!(
            key,
            digest = %meta.digest,
            size_bytes = meta.size_bytes,
            "Cached stage layer"
        );

        Ok(CachedLayer {
            path: layer_path,
            meta,
        })
    }

    /// Remove the entry for a stage key, if any.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        let (layer_path, meta_path) = self.entry_paths(key)?;
        for path in [layer_path, meta_path] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StratumError::CacheError(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Evict least-recently-used entries until the cache fits in `max_bytes`.
    ///
    /// Returns the number of entries evicted.
    pub fn prune(&self, max_bytes: u64) -> Result<usize> {
        let mut entries = self.list_entries()?;
        let mut current_size: u64 = entries.iter().map(|e| e.size_bytes).sum();
        if current_size <= max_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|e| e.last_accessed);

        let mut evicted = 0;
        for entry in &entries {
            if current_size <= max_bytes {
                break;
            }
            self.invalidate(&entry.key)?;
            current_size = current_size.saturating_sub(entry.size_bytes);
            evicted += 1;

            tracing::debug!(
                key = %entry.key,
                size_bytes = entry.size_bytes,
                "Evicted cached layer"
            );
        }

        Ok(evicted)
    }

    /// All entries, most recently used first.
    pub fn list_entries(&self) -> Result<Vec<LayerMeta>> {
        let read_dir = std::fs::read_dir(&self.cache_dir).map_err(|e| {
            StratumError::CacheError(format!(
                "Failed to read cache directory {}: {}",
                self.cache_dir.display(),
                e
            ))
        })?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(meta) = serde_json::from_str::<LayerMeta>(&content) {
                    entries.push(meta);
                }
            }
        }

        entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(entries)
    }

    /// Total size of all cached layers in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries()?.iter().map(|e| e.size_bytes).sum())
    }

    fn entry_paths(&self, key: &str) -> Result<(PathBuf, PathBuf)> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StratumError::CacheError(format!(
                "Invalid stage key: '{}'",
                key
            )));
        }
        Ok((
            self.cache_dir.join(format!("{}.tar.gz", key)),
            self.cache_dir.join(format!("{}.meta.json", key)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::build::layer::create_layer;
    use tempfile::TempDir;

    fn make_layer(dir: &Path, name: &str, content: &str) -> LayerInfo {
        let root = dir.join(format!("{}-root", name));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("file"), content).unwrap();
        create_layer(
            &root,
            &[PathBuf::from("file")],
            &dir.join(format!("{}.tar.gz", name)),
        )
        .unwrap()
    }

    fn key(n: u8) -> String {
        format!("{:02x}", n).repeat(32)
    }

    #[test]
    fn test_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache").join("layers");
        LayerCache::new(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_get_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(tmp.path()).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn test_put_then_get() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "deps", "aiogram==3.4.1");

        cache
            .put(&key(1), &layer, "RUN pip install -r requirements.txt")
            .unwrap();
        let hit = cache.get(&key(1)).unwrap().unwrap();

        assert_eq!(hit.meta.digest, layer.digest);
        assert_eq!(hit.meta.diff_id, layer.diff_id);
        assert_eq!(hit.meta.created_by, "RUN pip install -r requirements.txt");
        assert_eq!(hit.layer_info().size, layer.size);
        assert!(hit.path.is_file());
        assert_ne!(hit.path, layer.path);
    }

    #[test]
    fn test_get_updates_last_accessed() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "a", "a");

        let stored = cache.put(&key(1), &layer, "COPY . .").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let hit = cache.get(&key(1)).unwrap().unwrap();
        assert!(hit.meta.last_accessed > stored.meta.last_accessed);
    }

    #[test]
    fn test_truncated_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "a", "a");
        let stored = cache.put(&key(2), &layer, "COPY . .").unwrap();

        std::fs::write(&stored.path, b"trunc").unwrap();

        assert!(cache.get(&key(2)).unwrap().is_none());
        assert!(cache.list_entries().unwrap().is_empty());
    }

    #[test]
    fn test_invalidate() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "a", "a");
        cache.put(&key(3), &layer, "COPY . .").unwrap();

        cache.invalidate(&key(3)).unwrap();
        assert!(cache.get(&key(3)).unwrap().is_none());
        // Invalidating a missing key is not an error
        cache.invalidate(&key(3)).unwrap();
    }

    #[test]
    fn test_rejects_non_hex_key() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(tmp.path()).unwrap();
        assert!(matches!(
            cache.get("../../etc/passwd"),
            Err(StratumError::CacheError(_))
        ));
    }

    #[test]
    fn test_prune_evicts_least_recently_used() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();

        for n in 1..=3u8 {
            let layer = make_layer(tmp.path(), &format!("l{}", n), &"x".repeat(n as usize * 100));
            cache.put(&key(n), &layer, "RUN true").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        // Touch the oldest so it survives
        cache.get(&key(1)).unwrap().unwrap();

        let total = cache.total_size().unwrap();
        let newest_two: u64 = cache
            .list_entries()
            .unwrap()
            .iter()
            .take(2)
            .map(|e| e.size_bytes)
            .sum();

        let evicted = cache.prune(newest_two).unwrap();
        assert_eq!(evicted, 1);
        assert!(cache.get(&key(2)).unwrap().is_none());
        assert!(cache.get(&key(1)).unwrap().is_some());
        assert!(cache.total_size().unwrap() < total);
    }

    #[test]
    fn test_prune_under_limit_is_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = LayerCache::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "a", "a");
        cache.put(&key(1), &layer, "RUN true").unwrap();

        assert_eq!(cache.prune(u64::MAX).unwrap(), 0);
        assert_eq!(cache.list_entries().unwrap().len(), 1);
    }
}
