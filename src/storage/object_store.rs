use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tracing::{debug, info, warn};
use url::Url;

use crate::encoding::{FETCH_TIMEOUT, fetch_client};
use crate::error::StoreError;
use crate::image_processing;
use crate::storage::blob::BlobStore;

const OBJECT_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const PROMPT_STEM_CHARS: usize = 30;
const ESTIMATED_MB_PER_OBJECT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folder {
    References,
    Generated,
}

impl Folder {
    pub fn as_str(self) -> &'static str {
        match self {
            Folder::References => "references",
            Folder::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageStats {
    pub count: usize,
    pub estimated_size: String,
}

/// Uploads image content to the blob store and hands out retrieval URLs of the form
/// `{public_base}/v0/b/{bucket}/o/{percent-encoded key}?alt=media`.
#[derive(Clone)]
pub struct ObjectStore {
    blobs: Arc<dyn BlobStore>,
    http: reqwest::Client,
    public_base: String,
    bucket: String,
    host_pattern: String,
}

impl ObjectStore {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        public_base: &str,
        bucket: &str,
    ) -> Result<Self, StoreError> {
        let parsed = Url::parse(public_base)
            .map_err(|err| StoreError::Unavailable(format!("invalid public base URL: {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| StoreError::Unavailable("public base URL has no host".to_string()))?;
        let host_pattern = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            blobs,
            http: fetch_client(FETCH_TIMEOUT)?,
            public_base: public_base.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            host_pattern,
        })
    }

    /// Bound remote fetches in `upload_from_remote_url` by `timeout` instead.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Result<Self, StoreError> {
        self.http = fetch_client(timeout)?;
        Ok(self)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn download_url(&self, key: &str) -> String {
        let encoded = utf8_percent_encode(key.trim_start_matches('/'), OBJECT_PATH);
        format!(
            "{}/v0/b/{}/o/{}?alt=media",
            self.public_base, self.bucket, encoded
        )
    }

    /// Object key encoded in a retrieval URL, or `None` when the URL has another shape.
    pub fn object_path_from_url(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let (_, encoded) = parsed.path().split_once("/o/")?;
        if encoded.is_empty() {
            return None;
        }
        let decoded = percent_decode_str(encoded).decode_utf8().ok()?;
        Some(decoded.into_owned())
    }

    pub fn is_managed_url(&self, url: &str) -> bool {
        !image_processing::is_data_url(url) && url.contains(&self.host_pattern)
    }

    pub async fn upload(
        &self,
        content: &[u8],
        file_name: &str,
        folder: Folder,
    ) -> Result<String, StoreError> {
        let timestamp = Utc::now().timestamp_millis();
        let key = format!(
            "images/{}/{timestamp}-{}",
            folder.as_str(),
            sanitize_file_name(file_name)
        );
        debug!(target: "object_store::upload", "Uploading {} ({} bytes) to {}", file_name, content.len(), key);
        self.blobs.put(&key, content).await?;
        let url = self.download_url(&key);
        info!(target: "object_store::upload", "Upload successful: {}", url);
        Ok(url)
    }

    /// Fetch content from a data URL or reachable resource and store it under `generated`.
    pub async fn upload_from_remote_url(
        &self,
        remote_url: &str,
        prompt: &str,
    ) -> Result<String, StoreError> {
        let bytes = if image_processing::is_data_url(remote_url) {
            let payload = image_processing::data_url_payload(remote_url)
                .map_err(|err| StoreError::InvalidContent(err.to_string()))?;
            image_processing::decode_base64(payload)
                .map_err(|err| StoreError::InvalidContent(err.to_string()))?
        } else {
            let response = self.http.get(remote_url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(StoreError::Unavailable(format!(
                    "fetching {remote_url} failed: HTTP {status}"
                )));
            }
            response.bytes().await?.to_vec()
        };
        let file_name = format!(
            "generated-{}-{}.jpg",
            Utc::now().timestamp_millis(),
            prompt_file_stem(prompt)
        );
        self.upload(&bytes, &file_name, Folder::Generated).await
    }

    /// Best-effort removal. Never fails: unknown URL shapes are ignored and store
    /// errors are logged.
    pub async fn delete(&self, url: &str) {
        if !self.is_managed_url(url) {
            debug!(target: "object_store::delete", "Skipping delete of unmanaged URL");
            return;
        }
        let Some(path) = self.object_path_from_url(url) else {
            debug!(target: "object_store::delete", "URL has no object path: {}", url);
            return;
        };
        match self.blobs.delete(&path).await {
            Ok(()) => info!(target: "object_store::delete", "Deleted {}", path),
            Err(err) => warn!(target: "object_store::delete", "Deleting {} failed: {}", path, err),
        }
    }

    pub async fn list_images(&self) -> Vec<String> {
        match self.blobs.list("images").await {
            Ok(keys) => keys.iter().map(|key| self.download_url(key)).collect(),
            Err(err) => {
                warn!(target: "object_store::list_images", "Listing images failed: {}", err);
                Vec::new()
            }
        }
    }

    pub async fn storage_stats(&self) -> StorageStats {
        let count = self.list_images().await.len();
        StorageStats {
            count,
            estimated_size: format!("~{:.1} MB", count as f64 * ESTIMATED_MB_PER_OBJECT),
        }
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn prompt_file_stem(prompt: &str) -> String {
    prompt
        .chars()
        .take(PROMPT_STEM_CHARS)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_processing::test_support;
    use crate::storage::blob::LocalBlobStore;

    fn store(dir: &std::path::Path) -> ObjectStore {
        let blobs = Arc::new(LocalBlobStore::new(dir.to_path_buf()));
        ObjectStore::new(blobs, "http://127.0.0.1:3000", "ceramics").unwrap()
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_file_name("my vase (1).png"), "my_vase__1_.png");
        assert_eq!(sanitize_file_name("ok-name.v2.jpg"), "ok-name.v2.jpg");
        assert_eq!(prompt_file_stem("blue glaze vase!"), "blue_glaze_vase_");
        assert_eq!(prompt_file_stem(&"x".repeat(80)).len(), 30);
    }

    #[tokio::test]
    async fn uploaded_urls_are_managed_and_round_trip_to_the_key() {
        let temp = tempfile::tempdir().unwrap();
        let objects = store(temp.path());

        let url = objects
            .upload(b"bytes", "my vase.png", Folder::References)
            .await
            .unwrap();
        assert!(objects.is_managed_url(&url));
        assert!(url.starts_with("http://127.0.0.1:3000/v0/b/ceramics/o/images%2Freferences%2F"));

        let key = objects.object_path_from_url(&url).unwrap();
        assert!(key.starts_with("images/references/"));
        assert!(key.ends_with("-my_vase.png"));
        assert!(temp.path().join(&key).exists());
    }

    #[tokio::test]
    async fn data_urls_are_never_managed() {
        let temp = tempfile::tempdir().unwrap();
        let objects = store(temp.path());
        assert!(!objects.is_managed_url("data:image/png;base64,MTI3LjAuMC4xOjMwMDA="));
        assert!(!objects.is_managed_url("data:image/png;base64,127.0.0.1:3000"));
        assert!(!objects.is_managed_url("https://cdn.example.com/o/a.png"));
    }

    #[tokio::test]
    async fn upload_from_data_url_lands_in_generated() {
        let temp = tempfile::tempdir().unwrap();
        let objects = store(temp.path());
        let data_url = image_processing::to_data_url("image/png", &test_support::png_base64());

        let url = objects
            .upload_from_remote_url(&data_url, "blue glaze vase")
            .await
            .unwrap();
        let key = objects.object_path_from_url(&url).unwrap();
        assert!(key.starts_with("images/generated/"));
        assert!(key.contains("-generated-"));
        assert!(key.ends_with("-blue_glaze_vase.jpg"));

        let stored = std::fs::read(temp.path().join(&key)).unwrap();
        assert_eq!(stored, test_support::png_bytes());
    }

    #[tokio::test]
    async fn delete_removes_object_and_ignores_foreign_urls() {
        let temp = tempfile::tempdir().unwrap();
        let objects = store(temp.path());
        let url = objects
            .upload(b"bytes", "a.png", Folder::Generated)
            .await
            .unwrap();
        let key = objects.object_path_from_url(&url).unwrap();

        objects.delete("data:image/png;base64,AAAA").await;
        objects.delete("https://elsewhere.example.com/a.png").await;
        assert!(temp.path().join(&key).exists());

        objects.delete(&url).await;
        assert!(!temp.path().join(&key).exists());
        objects.delete(&url).await;
    }

    #[tokio::test]
    async fn stats_count_every_object() {
        let temp = tempfile::tempdir().unwrap();
        let objects = store(temp.path());
        objects.upload(b"1", "a.png", Folder::References).await.unwrap();
        objects.upload(b"2", "b.png", Folder::Generated).await.unwrap();

        assert_eq!(objects.list_images().await.len(), 2);
        let stats = objects.storage_stats().await;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.estimated_size, "~1.0 MB");
    }

    #[tokio::test]
    async fn remote_uploads_give_up_on_stalled_sources() {
        let temp = tempfile::tempdir().unwrap();
        let objects = store(temp.path())
            .with_fetch_timeout(Duration::from_millis(300))
            .unwrap();
        let base = test_support::stalled_server().await;

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            objects.upload_from_remote_url(&format!("{base}/generated.png"), "vase"),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
