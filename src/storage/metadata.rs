use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{GeneratedImage, ImageParameters, MultiViewImages, ReferenceImage, iso_timestamp};
use crate::storage::documents::{Document, DocumentQuery, DocumentStore};

pub const REFERENCE_COLLECTION: &str = "referenceImages";
pub const GENERATED_COLLECTION: &str = "generatedImages";
pub const DEFAULT_GENERATED_LIMIT: usize = 50;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceDocument {
    name: String,
    url: String,
    #[serde(default)]
    is_active: bool,
    #[serde(default, with = "iso_timestamp::option")]
    uploaded_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_timestamp::option")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_timestamp::option")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedDocument {
    prompt: String,
    url: String,
    parameters: ImageParameters,
    #[serde(default, with = "iso_timestamp::option")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    views: Option<MultiViewImages>,
}

/// Partial update of a reference record; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub is_active: Option<bool>,
}

impl ReferenceUpdate {
    pub fn active(is_active: bool) -> Self {
        Self {
            is_active: Some(is_active),
            ..Default::default()
        }
    }

    pub fn apply(&self, image: &mut ReferenceImage) {
        if let Some(name) = &self.name {
            image.name = name.clone();
        }
        if let Some(url) = &self.url {
            image.url = url.clone();
        }
        if let Some(is_active) = self.is_active {
            image.is_active = is_active;
        }
    }
}

/// Typed access to the reference and generated image collections.
#[derive(Clone)]
pub struct MetadataStore {
    documents: Arc<dyn DocumentStore>,
}

impl MetadataStore {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub async fn add_reference(&self, image: &ReferenceImage) -> Result<String, StoreError> {
        let now = Utc::now();
        let document = ReferenceDocument {
            name: image.name.clone(),
            url: image.url.clone(),
            is_active: image.is_active,
            uploaded_at: Some(image.uploaded_at),
            created_at: Some(now),
            updated_at: Some(now),
        };
        let id = self
            .documents
            .insert(REFERENCE_COLLECTION, to_map(&document)?)
            .await?;
        info!(target: "metadata::add_reference", "Reference image added with ID: {}", id);
        Ok(id)
    }

    pub async fn list_references(&self) -> Result<Vec<ReferenceImage>, StoreError> {
        let documents = self
            .documents
            .query(REFERENCE_COLLECTION, &DocumentQuery::newest_first("createdAt"))
            .await?;
        let images: Vec<_> = documents.into_iter().filter_map(reference_from_document).collect();
        debug!(target: "metadata::list_references", "Loaded {} reference images", images.len());
        Ok(images)
    }

    pub async fn update_reference(&self, id: &str, update: &ReferenceUpdate) -> Result<(), StoreError> {
        let mut fields = Map::new();
        if let Some(name) = &update.name {
            fields.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(url) = &update.url {
            fields.insert("url".to_string(), Value::String(url.clone()));
        }
        if let Some(is_active) = update.is_active {
            fields.insert("isActive".to_string(), Value::Bool(is_active));
        }
        fields.insert(
            "updatedAt".to_string(),
            Value::String(iso_timestamp::format(&Utc::now())),
        );
        self.documents.update(REFERENCE_COLLECTION, id, fields).await?;
        debug!(target: "metadata::update_reference", "Reference image updated: {}", id);
        Ok(())
    }

    pub async fn delete_reference(&self, id: &str) -> Result<(), StoreError> {
        self.documents.delete(REFERENCE_COLLECTION, id).await?;
        info!(target: "metadata::delete_reference", "Reference image deleted: {}", id);
        Ok(())
    }

    pub async fn add_generated(&self, image: &GeneratedImage) -> Result<String, StoreError> {
        let document = GeneratedDocument {
            prompt: image.prompt.clone(),
            url: image.url.clone(),
            parameters: image.parameters.clone(),
            created_at: Some(image.created_at),
            is_active: image.is_active,
            views: image.views.clone(),
        };
        let id = self
            .documents
            .insert(GENERATED_COLLECTION, to_map(&document)?)
            .await?;
        info!(target: "metadata::add_generated", "Generated image added with ID: {}", id);
        Ok(id)
    }

    /// Newest first, capped at `limit` (default 50).
    pub async fn list_generated(&self, limit: Option<usize>) -> Result<Vec<GeneratedImage>, StoreError> {
        let query = DocumentQuery::newest_first("createdAt")
            .limit(limit.unwrap_or(DEFAULT_GENERATED_LIMIT));
        let documents = self.documents.query(GENERATED_COLLECTION, &query).await?;
        let images: Vec<_> = documents.into_iter().filter_map(generated_from_document).collect();
        debug!(target: "metadata::list_generated", "Loaded {} generated images", images.len());
        Ok(images)
    }

    pub async fn set_generated_active(&self, id: &str, is_active: bool) -> Result<(), StoreError> {
        let mut fields = Map::new();
        fields.insert("isActive".to_string(), Value::Bool(is_active));
        self.documents.update(GENERATED_COLLECTION, id, fields).await
    }

    pub async fn delete_generated(&self, id: &str) -> Result<(), StoreError> {
        self.documents.delete(GENERATED_COLLECTION, id).await?;
        info!(target: "metadata::delete_generated", "Generated image deleted: {}", id);
        Ok(())
    }
}

fn to_map<T: Serialize>(value: &T) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidContent(format!("expected object, got {other}"))),
    }
}

fn reference_from_document(document: Document) -> Option<ReferenceImage> {
    let data: ReferenceDocument = serde_json::from_value(Value::Object(document.data)).ok()?;
    Some(ReferenceImage {
        id: document.id,
        name: data.name,
        url: data.url,
        is_active: data.is_active,
        uploaded_at: data.uploaded_at.or(data.created_at).unwrap_or_else(Utc::now),
    })
}

fn generated_from_document(document: Document) -> Option<GeneratedImage> {
    let data: GeneratedDocument = serde_json::from_value(Value::Object(document.data)).ok()?;
    Some(GeneratedImage {
        id: document.id,
        url: data.url,
        prompt: data.prompt,
        parameters: data.parameters,
        created_at: data.created_at.unwrap_or_else(Utc::now),
        is_active: data.is_active,
        views: data.views,
    })
}
