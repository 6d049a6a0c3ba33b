use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::models::{GeneratedImage, ReferenceImage};

const EVENT_CAPACITY: usize = 64;

/// Everything a view needs to render the reference and gallery screens.
#[derive(Debug, Clone, Default)]
pub struct ImageSnapshot {
    pub references: Vec<ReferenceImage>,
    pub generated: Vec<GeneratedImage>,
    pub prompt: String,
    pub is_generating: bool,
    pub storage_warning: Option<String>,
}

impl ImageSnapshot {
    /// Active references in list order.
    pub fn active_references(&self) -> Vec<ReferenceImage> {
        self.references
            .iter()
            .filter(|image| image.is_active)
            .cloned()
            .collect()
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Success { message: String },
    Failure { message: String },
    /// Non-fatal; persistence fell back to local storage.
    Warning { message: String },
}

/// Observable holder; every mutation swaps in a whole new snapshot.
#[derive(Clone)]
pub struct ImageState {
    snapshot: watch::Sender<Arc<ImageSnapshot>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Default for ImageState {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageState {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(ImageSnapshot::default()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { snapshot, events }
    }

    pub fn snapshot(&self) -> Arc<ImageSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ImageSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn update(&self, apply: impl FnOnce(&mut ImageSnapshot)) {
        self.snapshot.send_modify(|current| {
            let mut next = (**current).clone();
            apply(&mut next);
            *current = Arc::new(next);
        });
    }

    pub fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn set_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.update(|snapshot| snapshot.prompt = prompt);
    }

    pub fn active_references(&self) -> Vec<ReferenceImage> {
        self.snapshot.borrow().active_references()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
    Prompt,
}

pub fn sort_generated(images: &mut [GeneratedImage], order: SortOrder) {
    match order {
        SortOrder::Newest => images.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        SortOrder::Oldest => images.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        SortOrder::Prompt => images.sort_by(|a, b| a.prompt.cmp(&b.prompt)),
    }
}

/// `Prompt` orders references by display name.
pub fn sort_references(images: &mut [ReferenceImage], order: SortOrder) {
    match order {
        SortOrder::Newest => images.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at)),
        SortOrder::Oldest => images.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at)),
        SortOrder::Prompt => images.sort_by(|a, b| a.name.cmp(&b.name)),
    }
}
