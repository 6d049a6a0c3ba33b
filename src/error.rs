use thiserror::Error;

/// Failures raised by the blob, document and local key-value stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("local storage quota exceeded writing '{key}' ({needed} bytes, capacity {capacity})")]
    QuotaExceeded {
        key: String,
        needed: usize,
        capacity: usize,
    },

    #[error("document '{id}' not found in '{collection}'")]
    NotFound { collection: String, id: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid object content: {0}")]
    InvalidContent(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Errors surfaced by the generation pipeline and the gateway.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("malformed data URL")]
    MalformedDataUrl,

    #[error("failed to convert image to base64: {0}")]
    EncodingError(String),

    #[error("reference image '{name}' could not be encoded: {details}")]
    ReferenceEncodingFailed { name: String, details: String },

    #[error("upstream error (status {status}): {body}")]
    UpstreamError { status: u16, body: String },

    #[error("no image data returned from the generation service")]
    NoImageReturned,

    #[error("invalid image data: {0}")]
    InvalidImageData(String),

    #[error("storage unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("image '{0}' not found")]
    NotFound(String),

    #[error("a generation request is already in flight")]
    Busy,

    #[error("request cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl PipelineError {
    /// Stable machine-readable code used in gateway error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::PreconditionFailed(_) => "precondition_failed",
            PipelineError::MalformedDataUrl => "malformed_data_url",
            PipelineError::EncodingError(_) => "encoding_error",
            PipelineError::ReferenceEncodingFailed { .. } => "reference_encoding_failed",
            PipelineError::UpstreamError { .. } => "upstream_error",
            PipelineError::NoImageReturned => "no_image_returned",
            PipelineError::InvalidImageData(_) => "invalid_image_data",
            PipelineError::StoreUnavailable(_) => "store_unavailable",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Busy => "busy",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Network(_) => "network_error",
        }
    }
}
