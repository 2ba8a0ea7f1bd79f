//! Local model file cache
//!
//! Entries are keyed by the model's `source_index`, so every spec pointing at
//! the same readable source shares one set of files.

use gpufleet_core::{FleetResult, ModelSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Cached model files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedModel {
    /// `source_index` of the model source
    pub source_index: String,
    /// Human readable source, for listings
    pub readable_source: String,
    /// Path to the model file or directory
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    pub last_accessed: SystemTime,
    pub downloaded_at: SystemTime,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedModel>,
    current_size: u64,
}

/// Model file cache with optional LRU eviction
pub struct ModelFileCache {
    base_path: PathBuf,
    max_size: u64,
    lru_enabled: bool,
    state: RwLock<CacheState>,
}

impl ModelFileCache {
    pub fn new(base_path: PathBuf, max_size: u64, lru_enabled: bool) -> Self {
        Self {
            base_path,
            max_size,
            lru_enabled,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the cache directory if needed
    pub async fn init(&self) -> FleetResult<()> {
        if !self.base_path.exists() {
            tokio::fs::create_dir_all(&self.base_path).await?;
            info!(path = %self.base_path.display(), "Created model cache directory");
        }
        Ok(())
    }

    /// Where files for `source` live inside the cache
    pub fn target_path(&self, source: &ModelSource) -> PathBuf {
        let dir = self.base_path.join(source.source_index());
        match source.file_name() {
            Some(name) => dir.join(
                Path::new(name)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(name)),
            ),
            None => dir,
        }
    }

    /// Cached path for `source`, bumping its access time
    pub async fn resolve(&self, source: &ModelSource) -> Option<PathBuf> {
        let index = source.source_index();
        let mut state = self.state.write().await;
        state.entries.get_mut(&index).map(|entry| {
            entry.last_accessed = SystemTime::now();
            entry.path.clone()
        })
    }

    pub async fn contains(&self, source: &ModelSource) -> bool {
        self.state
            .read()
            .await
            .entries
            .contains_key(&source.source_index())
    }

    /// Record downloaded files, evicting older entries first when over budget
    pub async fn register(&self, source: &ModelSource, path: PathBuf, size: u64) -> FleetResult<()> {
        let index = source.source_index();
        if self.lru_enabled {
            self.ensure_space(&index, size).await?;
        }

        let now = SystemTime::now();
        let mut state = self.state.write().await;
        if let Some(old) = state.entries.remove(&index) {
            state.current_size = state.current_size.saturating_sub(old.size);
        }
        state.current_size += size;
        state.entries.insert(
            index.clone(),
            CachedModel {
                source_index: index,
                readable_source: source.readable_source(),
                path,
                size,
                last_accessed: now,
                downloaded_at: now,
            },
        );
        debug!(source = %source.readable_source(), size = size, "Registered model files");
        Ok(())
    }

    /// Drop an entry and delete its files when they live inside the cache
    pub async fn remove(&self, source_index: &str) -> FleetResult<()> {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.entries.remove(source_index);
            if let Some(entry) = &removed {
                state.current_size = state.current_size.saturating_sub(entry.size);
            }
            removed
        };

        if let Some(entry) = removed {
            if entry.path.starts_with(&self.base_path) && entry.path.exists() {
                if entry.path.is_dir() {
                    tokio::fs::remove_dir_all(&entry.path).await?;
                } else {
                    tokio::fs::remove_file(&entry.path).await?;
                }
            }
            info!(source = %entry.readable_source, "Removed model files from cache");
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<CachedModel> {
        let state = self.state.read().await;
        let mut entries: Vec<CachedModel> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.readable_source.cmp(&b.readable_source));
        entries
    }

    async fn ensure_space(&self, incoming: &str, needed: u64) -> FleetResult<()> {
        let victims: Vec<String> = {
            let state = self.state.read().await;
            let reclaimable = state.entries.get(incoming).map_or(0, |e| e.size);
            let projected = state.current_size.saturating_sub(reclaimable) + needed;
            if projected <= self.max_size {
                return Ok(());
            }
            let to_free = projected - self.max_size;

            let mut by_access: Vec<&CachedModel> = state
                .entries
                .values()
                .filter(|e| e.source_index != incoming)
                .collect();
            by_access.sort_by_key(|e| e.last_accessed);

            let mut freed = 0u64;
            by_access
                .into_iter()
                .take_while(|e| {
                    let take = freed < to_free;
                    freed += e.size;
                    take
                })
                .map(|e| e.source_index.clone())
                .collect()
        };

        for index in victims {
            warn!(source_index = %index, "Evicting model files from cache (LRU)");
            self.remove(&index).await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            total_size: state.current_size,
            max_size: self.max_size,
            model_count: state.entries.len(),
            utilization: if self.max_size == 0 {
                0.0
            } else {
                (state.current_size as f64 / self.max_size as f64) * 100.0
            },
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_size: u64,
    pub max_size: u64,
    pub model_count: usize,
    /// Percentage of `max_size` in use
    pub utilization: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hf(file: &str) -> ModelSource {
        ModelSource::huggingface("Qwen/Qwen2-0.5B-Instruct-GGUF", Some(file)).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelFileCache::new(dir.path().to_path_buf(), 1 << 20, false);
        let source = hf("q4_0.gguf");

        assert!(cache.resolve(&source).await.is_none());
        let path = cache.target_path(&source);
        assert!(path.starts_with(dir.path()));
        assert!(path.ends_with("q4_0.gguf"));

        cache.register(&source, path.clone(), 1024).await.unwrap();
        assert_eq!(cache.resolve(&source).await, Some(path));
        assert!(!cache.contains(&hf("q8_0.gguf")).await);
    }

    #[tokio::test]
    async fn test_same_readable_source_shares_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelFileCache::new(dir.path().to_path_buf(), 1 << 20, false);
        cache
            .register(&hf("q4_0.gguf"), PathBuf::from("/models/q4.gguf"), 10)
            .await
            .unwrap();
        cache
            .register(&hf("q4_0.gguf"), PathBuf::from("/models/q4.gguf"), 20)
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.model_count, 1);
        assert_eq!(stats.total_size, 20);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelFileCache::new(dir.path().to_path_buf(), 100, true);
        let old = hf("old.gguf");
        let new = hf("new.gguf");

        let old_path = cache.target_path(&old);
        tokio::fs::create_dir_all(old_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&old_path, b"gguf").await.unwrap();
        cache.register(&old, old_path.clone(), 80).await.unwrap();

        cache
            .register(&new, cache.target_path(&new), 50)
            .await
            .unwrap();

        assert!(!cache.contains(&old).await);
        assert!(!old_path.exists());
        assert_eq!(cache.stats().await.total_size, 50);
    }
}
