use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::fs;

use crate::error::StoreError;
use crate::models::iso_timestamp;
use crate::storage::hash::document_id;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub order_by: Option<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl DocumentQuery {
    pub fn newest_first(field: &str) -> Self {
        Self {
            order_by: Some(field.to_string()),
            descending: true,
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Collection-oriented document store with store-assigned identifiers.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, collection: &str, data: Map<String, Value>) -> Result<String, StoreError>;
    async fn query(&self, collection: &str, query: &DocumentQuery) -> Result<Vec<Document>, StoreError>;
    /// Merge `fields` into an existing document.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
}

/// Stores each document as `{base_dir}/{collection}/{id}.json`.
#[derive(Debug)]
pub struct LocalDocumentStore {
    base_dir: PathBuf,
    counter: AtomicU64,
}

impl LocalDocumentStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            counter: AtomicU64::new(0),
        }
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_segment(collection) {
            return Err(StoreError::InvalidKey(collection.to_string()));
        }
        Ok(self.base_dir.join(collection))
    }

    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_segment(id) {
            return Err(StoreError::InvalidKey(id.to_string()));
        }
        Ok(self.collection_dir(collection)?.join(format!("{id}.json")))
    }

    fn next_id(&self, collection: &str) -> String {
        let sequence = self.counter.fetch_add(1, AtomicOrdering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        document_id(&format!("{collection}:{nanos}:{sequence}:{}", std::process::id()))
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn insert(&self, collection: &str, data: Map<String, Value>) -> Result<String, StoreError> {
        let dir = self.collection_dir(collection)?;
        fs::create_dir_all(&dir).await?;
        let id = self.next_id(collection);
        let payload = serde_json::to_vec_pretty(&data)?;
        fs::write(dir.join(format!("{id}.json")), payload).await?;
        Ok(id)
    }

    async fn query(&self, collection: &str, query: &DocumentQuery) -> Result<Vec<Document>, StoreError> {
        let dir_path = self.collection_dir(collection)?;
        let mut dir = match fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut documents = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let bytes = fs::read(&path).await?;
            if let Ok(data) = serde_json::from_slice::<Map<String, Value>>(&bytes) {
                documents.push(Document {
                    id: id.to_string(),
                    data,
                });
            }
        }

        if let Some(field) = query.order_by.as_deref() {
            documents.sort_by(|a, b| {
                let ordering = compare_values(a.data.get(field), b.data.get(field));
                if query.descending { ordering.reverse() } else { ordering }
            });
        }
        if let Some(limit) = query.limit {
            documents.truncate(limit);
        }
        Ok(documents)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let path = self.document_path(collection, id)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let mut data: Map<String, Value> = serde_json::from_slice(&bytes)?;
        data.extend(fields);
        fs::write(&path, serde_json::to_vec_pretty(&data)?).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let path = self.document_path(collection, id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Missing values sort first; timestamp strings compare chronologically.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (iso_timestamp::parse(a), iso_timestamp::parse(b)) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}
