use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{error, warn};

use crate::error::StoreError;
use crate::models::{GeneratedImage, ReferenceImage};

pub const REFERENCES_KEY: &str = "referenceImages";
pub const GENERATED_KEY: &str = "generatedImages";

/// Most recent references kept when the full set no longer fits.
pub const REFERENCE_QUOTA_CAP: usize = 10;
pub const GENERATED_CAP: usize = 20;
pub const GENERATED_QUOTA_CAP: usize = 5;

const DEFAULT_CAPACITY_BYTES: usize = 5 * 1024 * 1024;

/// String key-value persistence with a bounded total size.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Fails with [`StoreError::QuotaExceeded`] when the write would exceed capacity.
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove_item(&self, key: &str) -> Result<(), StoreError>;
}

/// One file per key under a directory; capacity covers the sum of all values.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
    capacity: usize,
}

impl FileKeyValueStore {
    pub fn new(dir: PathBuf) -> Self {
        Self::with_capacity(dir, DEFAULT_CAPACITY_BYTES)
    }

    pub fn with_capacity(dir: PathBuf, capacity: usize) -> Self {
        Self { dir, capacity }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    async fn used_bytes_excluding(&self, excluded: &PathBuf) -> Result<usize, StoreError> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut total = 0usize;
        while let Some(entry) = dir.next_entry().await? {
            if &entry.path() == excluded {
                continue;
            }
            total = total.saturating_add(entry.metadata().await?.len() as usize);
        }
        Ok(total)
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let used = self.used_bytes_excluding(&path).await?;
        let needed = used.saturating_add(value.len());
        if needed > self.capacity {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                needed,
                capacity: self.capacity,
            });
        }
        fs::create_dir_all(&self.dir).await?;
        fs::write(&path, value).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Metadata fallback used while the cloud stores are unreachable.
#[derive(Clone)]
pub struct LocalPersistence {
    kv: Arc<dyn KeyValueStore>,
}

impl LocalPersistence {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Persist references newest first. On quota exhaustion only the
    /// [`REFERENCE_QUOTA_CAP`] most recent are kept. Returns how many were written.
    pub async fn save_references(&self, images: &[ReferenceImage]) -> Result<usize, StoreError> {
        let mut sorted = images.to_vec();
        sorted.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        self.save_with_pruning(REFERENCES_KEY, &sorted, sorted.len(), REFERENCE_QUOTA_CAP)
            .await
    }

    pub async fn load_references(&self) -> Vec<ReferenceImage> {
        self.load(REFERENCES_KEY).await
    }

    pub async fn save_generated(&self, images: &[GeneratedImage]) -> Result<usize, StoreError> {
        let mut sorted = images.to_vec();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.save_with_pruning(GENERATED_KEY, &sorted, GENERATED_CAP, GENERATED_QUOTA_CAP)
            .await
    }

    pub async fn load_generated(&self) -> Vec<GeneratedImage> {
        self.load(GENERATED_KEY).await
    }

    async fn save_with_pruning<T: Serialize>(
        &self,
        key: &str,
        newest_first: &[T],
        cap: usize,
        quota_cap: usize,
    ) -> Result<usize, StoreError> {
        let kept = &newest_first[..newest_first.len().min(cap)];
        match self.kv.set_item(key, &serde_json::to_string(kept)?).await {
            Ok(()) => Ok(kept.len()),
            Err(StoreError::QuotaExceeded { .. }) if kept.len() > quota_cap => {
                warn!(
                    target: "local::save",
                    "Local storage quota exceeded for '{}', keeping the {} most recent records",
                    key, quota_cap
                );
                let pruned = &kept[..quota_cap];
                self.kv.set_item(key, &serde_json::to_string(pruned)?).await?;
                Ok(pruned.len())
            }
            Err(err) => Err(err),
        }
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        let raw = match self.kv.get_item(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                error!(target: "local::load", "Reading '{}' failed: {}", key, err);
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            error!(target: "local::load", "Parsing '{}' failed: {}", key, err);
            Vec::new()
        })
    }
}
