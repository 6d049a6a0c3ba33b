use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::StoreError;

/// Opaque binary object store addressed by slash-separated keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Blob store backed by a directory tree.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let normalized = key.trim_start_matches('/');
        let relative = Path::new(normalized);
        if normalized.is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_dir).ok()?;
        let parts: Vec<_> = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, data).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.resolve_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.resolve_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let root = self.resolve_path(prefix)?;
        let mut pending = vec![root];
        let mut keys = Vec::new();
        while let Some(dir_path) = pending.pop() {
            let mut dir = match fs::read_dir(&dir_path).await {
                Ok(dir) => dir,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_delete() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(temp.path().to_path_buf());

        store.put("images/references/1-a.png", b"one").await.unwrap();
        store.put("images/generated/2-b.jpg", b"two").await.unwrap();

        assert_eq!(
            store.get("images/references/1-a.png").await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(
            store.list("images").await.unwrap(),
            vec![
                "images/generated/2-b.jpg".to_string(),
                "images/references/1-a.png".to_string()
            ]
        );

        store.delete("images/generated/2-b.jpg").await.unwrap();
        store.delete("images/generated/2-b.jpg").await.unwrap();
        assert_eq!(store.get("images/generated/2-b.jpg").await.unwrap(), None);
        assert!(store.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_keys_escaping_the_root() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(temp.path().to_path_buf());
        assert!(matches!(
            store.put("images/../../etc/passwd", b"x").await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
