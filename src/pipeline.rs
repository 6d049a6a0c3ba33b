use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::encoding::ImageEncoder;
use crate::error::{PipelineError, StoreError};
use crate::gateway::{GatewayClient, GenerateImageRequest, GenerationGateway};
use crate::image_processing::{self, decode_base64_image, detect_mime_type, to_data_url};
use crate::models::{GeneratedImage, GenerationMode, ImageParameters, ReferenceImage};
use crate::state::{ImageSnapshot, ImageState, PipelineEvent};
use crate::storage::{
    Folder, LocalPersistence, MetadataStore, ObjectStore, ReferenceUpdate, StorageStats,
};

/// MIME type every encoded reference is labelled with before it goes to the gateway.
const REFERENCE_MIME_TYPE: &str = "image/jpeg";

/// Newest stored generated images checked for duplicates during migration.
const MIGRATION_DEDUP_WINDOW: usize = 100;

/// Result of one successful generation run.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub image: GeneratedImage,
    pub reference: ReferenceImage,
    /// Set when cloud persistence failed and the image lives in memory only.
    pub warning: Option<String>,
}

/// Coordinates encoding, generation and persistence, and owns the observable state.
pub struct ImagePipeline {
    gateway: Arc<dyn GenerationGateway>,
    encoder: ImageEncoder,
    objects: ObjectStore,
    metadata: MetadataStore,
    local: LocalPersistence,
    state: ImageState,
    config: PipelineConfig,
    in_flight: AtomicBool,
}

/// Releases the in-flight flag and the generating indicator, even if the run is dropped.
struct GenerationGuard<'a> {
    flag: &'a AtomicBool,
    state: &'a ImageState,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.state.update(|snapshot| snapshot.is_generating = false);
        self.flag.store(false, Ordering::Release);
    }
}

impl ImagePipeline {
    pub fn new(
        gateway: Arc<dyn GenerationGateway>,
        encoder: ImageEncoder,
        objects: ObjectStore,
        metadata: MetadataStore,
        local: LocalPersistence,
        config: PipelineConfig,
    ) -> Self {
        Self {
            gateway,
            encoder,
            objects,
            metadata,
            local,
            state: ImageState::new(),
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Pipeline talking to a remote gateway, with the default encoding chain.
    pub fn connect(
        config: PipelineConfig,
        objects: ObjectStore,
        metadata: MetadataStore,
        local: LocalPersistence,
    ) -> Result<Self, PipelineError> {
        let gateway = Arc::new(GatewayClient::new(config.gateway_url.clone()));
        let encoder = ImageEncoder::with_default_chain(config.convert_endpoint.as_deref())?;
        Ok(Self::new(gateway, encoder, objects, metadata, local, config))
    }

    pub fn state(&self) -> &ImageState {
        &self.state
    }

    pub fn snapshot(&self) -> Arc<ImageSnapshot> {
        self.state.snapshot()
    }

    /// Hydrate state from the metadata store, or from local persistence when it is down.
    pub async fn load(&self) -> Arc<ImageSnapshot> {
        let mut warnings = Vec::new();
        let references = match self.metadata.list_references().await {
            Ok(references) => references,
            Err(err) => {
                warnings.push(self.log_store_failure("Loading references", &err));
                self.local.load_references().await
            }
        };
        let generated = match self
            .metadata
            .list_generated(Some(self.config.generated_limit))
            .await
        {
            Ok(generated) => generated,
            Err(err) => {
                warnings.push(self.log_store_failure("Loading generated images", &err));
                self.local.load_generated().await
            }
        };
        info!(
            target: "pipeline::load",
            "Loaded {} references and {} generated images",
            references.len(),
            generated.len()
        );

        let warning = (!warnings.is_empty()).then(|| warnings.join("; "));
        self.state.update(|snapshot| {
            snapshot.references = references;
            snapshot.generated = generated;
            snapshot.storage_warning = warning.clone();
        });
        if let Some(message) = warning {
            self.state.emit(PipelineEvent::Warning { message });
        }
        self.state.snapshot()
    }

    /// Run one generation end to end. Rejects with [`PipelineError::Busy`] while
    /// another run is in flight.
    pub async fn generate(
        &self,
        prompt: &str,
        mode: GenerationMode,
        token: &CancellationToken,
    ) -> Result<GenerationOutcome, PipelineError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(target: "pipeline::generate", "Generation already in flight, rejecting");
            return Err(PipelineError::Busy);
        }
        let _guard = GenerationGuard {
            flag: &self.in_flight,
            state: &self.state,
        };
        self.state.update(|snapshot| snapshot.is_generating = true);

        match self.run_generation(prompt, mode, token).await {
            Ok(outcome) => {
                self.state.update(|snapshot| snapshot.prompt.clear());
                self.state.emit(PipelineEvent::Success {
                    message: format!("Generated image for \"{}\"", outcome.image.prompt),
                });
                Ok(outcome)
            }
            Err(PipelineError::Cancelled) => {
                info!(target: "pipeline::generate", "Generation cancelled");
                Err(PipelineError::Cancelled)
            }
            Err(err) => {
                error!(target: "pipeline::generate", "Generation failed: {}", err);
                self.state.emit(PipelineEvent::Failure {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_generation(
        &self,
        prompt: &str,
        mode: GenerationMode,
        token: &CancellationToken,
    ) -> Result<GenerationOutcome, PipelineError> {
        if prompt.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("Prompt is required".to_string()));
        }
        let active = self.state.active_references();
        if mode.requires_reference() && active.is_empty() {
            return Err(PipelineError::PreconditionFailed(format!(
                "{mode:?} mode needs at least one active reference image"
            )));
        }
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let reference_images = self.encode_references(&active, token).await?;
        let composed = mode.compose_prompt(prompt);
        let request = GenerateImageRequest {
            prompt: composed.clone(),
            reference_images,
            edit_mode: mode.edit_mode(),
        };
        info!(
            target: "pipeline::generate",
            "Requesting {:?} generation with {} references",
            mode,
            request.reference_images.len()
        );
        let data = self.gateway.generate(&request, token).await?;

        let info = decode_base64_image(&data)?;
        debug!(
            target: "pipeline::generate",
            "Received {}x{} {} ({} bytes)",
            info.width,
            info.height,
            info.mime_type,
            info.size
        );
        let candidate = GeneratedImage {
            id: Uuid::new_v4().to_string(),
            url: to_data_url(info.mime_type, &data),
            parameters: ImageParameters::for_prompt(&composed),
            prompt: composed,
            created_at: Utc::now(),
            is_active: self.config.activate_generated,
            views: None,
        };

        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let (image, reference, warning) = self.persist_generated(candidate).await;

        self.state.update(|snapshot| {
            snapshot.generated.insert(0, image.clone());
            snapshot.references.insert(0, reference.clone());
            if warning.is_some() {
                snapshot.storage_warning = warning.clone();
            }
        });
        if warning.is_some() {
            self.save_locally().await;
        }
        Ok(GenerationOutcome {
            image,
            reference,
            warning,
        })
    }

    async fn encode_references(
        &self,
        references: &[ReferenceImage],
        token: &CancellationToken,
    ) -> Result<Vec<String>, PipelineError> {
        let mut encoded = Vec::with_capacity(references.len());
        for reference in references {
            match self.encoder.to_base64(&reference.url, token).await {
                Ok(payload) => encoded.push(to_data_url(REFERENCE_MIME_TYPE, &payload)),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    return Err(PipelineError::ReferenceEncodingFailed {
                        name: reference.name.clone(),
                        details: err.to_string(),
                    });
                }
            }
        }
        Ok(encoded)
    }

    /// Upload and record a generated image plus its mirror. On any store failure the
    /// candidate is kept as-is with a freshly minted mirror and a warning.
    async fn persist_generated(
        &self,
        candidate: GeneratedImage,
    ) -> (GeneratedImage, ReferenceImage, Option<String>) {
        match self.try_persist_generated(&candidate).await {
            Ok((image, reference)) => (image, reference, None),
            Err(err) => {
                let warning = self.log_store_failure("Saving generated image", &err);
                self.state.emit(PipelineEvent::Warning {
                    message: warning.clone(),
                });
                let reference = ReferenceImage::mirror_of(&candidate);
                (candidate, reference, Some(warning))
            }
        }
    }

    async fn try_persist_generated(
        &self,
        candidate: &GeneratedImage,
    ) -> Result<(GeneratedImage, ReferenceImage), StoreError> {
        let mut image = candidate.clone();
        let uploaded = !self.objects.is_managed_url(&image.url);
        if uploaded {
            image.url = self
                .objects
                .upload_from_remote_url(&candidate.url, &candidate.prompt)
                .await?;
        }

        image.id = match self.metadata.add_generated(&image).await {
            Ok(id) => id,
            Err(err) => {
                if uploaded {
                    self.objects.delete(&image.url).await;
                }
                return Err(err);
            }
        };

        let mut reference = ReferenceImage::mirror_of(&image);
        match self.metadata.add_reference(&reference).await {
            Ok(id) => reference.id = id,
            Err(err) => {
                if let Err(cleanup) = self.metadata.delete_generated(&image.id).await {
                    warn!(target: "pipeline::persist", "Rolling back {} failed: {}", image.id, cleanup);
                }
                if uploaded {
                    self.objects.delete(&image.url).await;
                }
                return Err(err);
            }
        }
        info!(target: "pipeline::persist", "Persisted generated image {} at {}", image.id, image.url);
        Ok((image, reference))
    }

    /// Upload a new reference. It starts inactive. When the stores are down it is
    /// kept in memory as an inline data URL.
    pub async fn upload_reference(
        &self,
        content: &[u8],
        file_name: &str,
    ) -> Result<ReferenceImage, PipelineError> {
        let mime_type = detect_mime_type(content).ok_or_else(|| {
            PipelineError::InvalidRequest(format!("{file_name} is not a supported image file"))
        })?;
        let mut image = ReferenceImage {
            id: String::new(),
            url: String::new(),
            name: file_name.to_string(),
            is_active: false,
            uploaded_at: Utc::now(),
        };

        let warning = match self.try_store_reference(content, &image).await {
            Ok((id, url)) => {
                image.id = id;
                image.url = url;
                None
            }
            Err(err) => {
                image.id = Uuid::new_v4().to_string();
                image.url = to_data_url(mime_type, &image_processing::encode_base64(content));
                Some(self.log_store_failure("Uploading reference", &err))
            }
        };

        self.state.update(|snapshot| snapshot.references.insert(0, image.clone()));
        match warning {
            Some(message) => self.degrade(message).await,
            None => self.state.emit(PipelineEvent::Success {
                message: format!("Uploaded {file_name}"),
            }),
        }
        Ok(image)
    }

    async fn try_store_reference(
        &self,
        content: &[u8],
        image: &ReferenceImage,
    ) -> Result<(String, String), StoreError> {
        let url = self
            .objects
            .upload(content, &image.name, Folder::References)
            .await?;
        let stored = ReferenceImage {
            url: url.clone(),
            ..image.clone()
        };
        match self.metadata.add_reference(&stored).await {
            Ok(id) => Ok((id, url)),
            Err(err) => {
                self.objects.delete(&url).await;
                Err(err)
            }
        }
    }

    /// Flip a reference's `isActive`. Mirrors keep their generated image in step.
    pub async fn toggle_reference(&self, id: &str) -> Result<bool, PipelineError> {
        let current = self.find_reference(id)?;
        let is_active = !current.is_active;
        self.update_reference(id, ReferenceUpdate::active(is_active))
            .await?;

        if current.is_generated() {
            let twin = self
                .snapshot()
                .generated
                .iter()
                .find(|image| image.url == current.url)
                .map(|image| image.id.clone());
            if let Some(generated_id) = twin {
                self.set_generated_flag(&generated_id, is_active).await;
            }
        }
        Ok(is_active)
    }

    pub async fn update_reference(
        &self,
        id: &str,
        update: ReferenceUpdate,
    ) -> Result<ReferenceImage, PipelineError> {
        let mut image = self.find_reference(id)?;
        update.apply(&mut image);

        let result = self.metadata.update_reference(id, &update).await;
        let mut current = None;
        self.state.update(|snapshot| {
            if let Some(slot) = snapshot.references.iter_mut().find(|r| r.id == id) {
                update.apply(slot);
                current = Some(slot.clone());
            }
        });
        if let Err(err) = result {
            let message = self.log_store_failure("Updating reference", &err);
            self.degrade(message).await;
        }
        Ok(current.unwrap_or(image))
    }

    /// Remove a reference. Blob cleanup is best effort and skipped while a generated
    /// image still points at the same object.
    pub async fn delete_reference(&self, id: &str) -> Result<(), PipelineError> {
        let image = self.find_reference(id)?;
        let shared = self
            .snapshot()
            .generated
            .iter()
            .any(|generated| generated.url == image.url);
        if !shared {
            self.objects.delete(&image.url).await;
        }

        let result = self.metadata.delete_reference(id).await;
        self.state
            .update(|snapshot| snapshot.references.retain(|r| r.id != id));
        match result {
            Ok(()) => self.state.emit(PipelineEvent::Success {
                message: format!("Deleted {}", image.name),
            }),
            Err(err) => {
                let message = self.log_store_failure("Deleting reference", &err);
                self.degrade(message).await;
            }
        }
        Ok(())
    }

    /// Remove a generated image together with its mirrored reference.
    pub async fn delete_generated(&self, id: &str) -> Result<(), PipelineError> {
        let snapshot = self.snapshot();
        let image = snapshot
            .generated
            .iter()
            .find(|image| image.id == id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        let mirror = snapshot
            .references
            .iter()
            .find(|reference| reference.is_generated() && reference.url == image.url)
            .map(|reference| reference.id.clone());

        self.objects.delete(&image.url).await;
        let mut failures = Vec::new();
        if let Err(err) = self.metadata.delete_generated(id).await {
            failures.push(err);
        }
        if let Some(mirror_id) = &mirror {
            if let Err(err) = self.metadata.delete_reference(mirror_id).await {
                failures.push(err);
            }
        }

        self.state.update(|snapshot| {
            snapshot.generated.retain(|generated| generated.id != id);
            if let Some(mirror_id) = &mirror {
                snapshot.references.retain(|reference| &reference.id != mirror_id);
            }
        });
        match failures.first() {
            None => self.state.emit(PipelineEvent::Success {
                message: "Deleted generated image".to_string(),
            }),
            Some(err) => {
                let message = self.log_store_failure("Deleting generated image", err);
                self.degrade(message).await;
            }
        }
        Ok(())
    }

    /// Flip a generated image's `isActive` and its mirror's.
    pub async fn toggle_generated(&self, id: &str) -> Result<bool, PipelineError> {
        let snapshot = self.snapshot();
        let image = snapshot
            .generated
            .iter()
            .find(|image| image.id == id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))?;
        let is_active = !image.is_active;
        let mirror = snapshot
            .references
            .iter()
            .find(|reference| reference.is_generated() && reference.url == image.url)
            .map(|reference| reference.id.clone());

        self.set_generated_flag(id, is_active).await;
        if let Some(mirror_id) = mirror {
            self.update_reference(&mirror_id, ReferenceUpdate::active(is_active))
                .await?;
        }
        Ok(is_active)
    }

    async fn set_generated_flag(&self, id: &str, is_active: bool) {
        let result = self.metadata.set_generated_active(id, is_active).await;
        self.state.update(|snapshot| {
            if let Some(image) = snapshot.generated.iter_mut().find(|image| image.id == id) {
                image.is_active = is_active;
            }
        });
        if let Err(err) = result {
            let message = self.log_store_failure("Updating generated image", &err);
            self.degrade(message).await;
        }
    }

    /// Copy locally persisted references and generated images into the metadata
    /// store, skipping URLs it already holds. Returns how many records were added.
    pub async fn migrate_local_to_store(&self) -> Result<usize, PipelineError> {
        let local_references = self.local.load_references().await;
        let local_generated = self.local.load_generated().await;
        if local_references.is_empty() && local_generated.is_empty() {
            return Ok(0);
        }

        let mut migrated = 0;
        if !local_references.is_empty() {
            let existing: HashSet<String> = self
                .metadata
                .list_references()
                .await?
                .into_iter()
                .map(|image| image.url)
                .collect();
            for image in local_references
                .iter()
                .filter(|image| !existing.contains(&image.url))
            {
                self.metadata.add_reference(image).await?;
                migrated += 1;
            }
        }
        if !local_generated.is_empty() {
            let existing: HashSet<String> = self
                .metadata
                .list_generated(Some(MIGRATION_DEDUP_WINDOW))
                .await?
                .into_iter()
                .map(|image| image.url)
                .collect();
            for image in local_generated
                .iter()
                .filter(|image| !existing.contains(&image.url))
            {
                self.metadata.add_generated(image).await?;
                migrated += 1;
            }
        }
        info!(
            target: "pipeline::migrate",
            "Migrated {} of {} local records",
            migrated,
            local_references.len() + local_generated.len()
        );

        let references = self.metadata.list_references().await?;
        let generated = self
            .metadata
            .list_generated(Some(self.config.generated_limit))
            .await?;
        self.state.update(|snapshot| {
            snapshot.references = references;
            snapshot.generated = generated;
            snapshot.storage_warning = None;
        });
        Ok(migrated)
    }

    pub async fn list_images(&self) -> Vec<String> {
        self.objects.list_images().await
    }

    pub async fn storage_stats(&self) -> StorageStats {
        self.objects.storage_stats().await
    }

    fn find_reference(&self, id: &str) -> Result<ReferenceImage, PipelineError> {
        self.snapshot()
            .references
            .iter()
            .find(|image| image.id == id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    fn log_store_failure(&self, action: &str, err: &StoreError) -> String {
        warn!(target: "pipeline::store", "{} failed, falling back to local state: {}", action, err);
        format!("Cloud storage unavailable, changes kept locally ({action}: {err})")
    }

    /// Record a store warning, surface it and snapshot the state locally.
    async fn degrade(&self, message: String) {
        self.state
            .update(|snapshot| snapshot.storage_warning = Some(message.clone()));
        self.state.emit(PipelineEvent::Warning { message });
        self.save_locally().await;
    }

    async fn save_locally(&self) {
        let snapshot = self.snapshot();
        if let Err(err) = self.local.save_references(&snapshot.references).await {
            error!(target: "pipeline::local", "Saving references locally failed: {}", err);
        }
        if let Err(err) = self.local.save_generated(&snapshot.generated).await {
            error!(target: "pipeline::local", "Saving generated images locally failed: {}", err);
        }
    }
}
