use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use url::Url;

use crate::encoding::{FETCH_TIMEOUT, fetch_base64, fetch_client};
use crate::error::PipelineError;
use crate::gateway::{
    ConvertImageRequest, ConvertImageResponse, ErrorResponse, GenerateImageRequest,
    GenerateImageResponse, GenerationGateway,
};
use crate::image_processing::detect_mime_type;
use crate::storage::BlobStore;

const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayState {
    pub generator: Arc<dyn GenerationGateway>,
    pub http: Client,
    /// Served under `/v0/b/{bucket}/o/...` when present.
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub bucket: String,
}

impl GatewayState {
    pub fn new(generator: Arc<dyn GenerationGateway>) -> Self {
        Self {
            generator,
            http: fetch_client(FETCH_TIMEOUT).unwrap_or_default(),
            blobs: None,
            bucket: String::new(),
        }
    }

    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        self.blobs = Some(blobs);
        self.bucket = bucket.into();
        self
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/generate-image", post(generate_image))
        .route("/convert-image", post(convert_image))
        .route("/v0/b/{bucket}/o/{*object}", get(serve_object))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn json_error(status: StatusCode, message: &str, code: Option<&str>, upstream: Option<u16>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.map(str::to_string),
            status: upstream,
        }),
    )
        .into_response()
}

fn error_response(err: &PipelineError) -> Response {
    let status = match err {
        PipelineError::InvalidRequest(_) | PipelineError::MalformedDataUrl => StatusCode::BAD_REQUEST,
        PipelineError::UpstreamError { .. }
        | PipelineError::NoImageReturned
        | PipelineError::EncodingError(_)
        | PipelineError::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    match err {
        PipelineError::UpstreamError { status: upstream, body } => json_error(
            status,
            &format!("Gemini API error: {upstream} - {body}"),
            Some(err.code()),
            Some(*upstream),
        ),
        PipelineError::InvalidRequest(message) => json_error(status, message, Some(err.code()), None),
        _ => json_error(status, &err.to_string(), Some(err.code()), None),
    }
}

/// Malformed bodies get the same JSON error shape as every other failure.
fn rejection_response(rejection: JsonRejection) -> Response {
    warn!(target: "gateway::request", "Rejected request body: {}", rejection.body_text());
    error_response(&PipelineError::InvalidRequest(rejection.body_text()))
}

fn validate_http_url(raw: &str) -> Result<Url, PipelineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidRequest("imageUrl is required".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|err| PipelineError::InvalidRequest(format!("invalid imageUrl: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(PipelineError::InvalidRequest(format!(
            "only http or https URLs are allowed, got {scheme}"
        ))),
    }
}

pub async fn generate_image(
    State(state): State<GatewayState>,
    payload: Result<Json<GenerateImageRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection),
    };
    if request.prompt.trim().is_empty() {
        return error_response(&PipelineError::InvalidRequest("Prompt is required".to_string()));
    }
    info!(
        target: "gateway::generate_image",
        "Generating image ({} references, edit_mode={})",
        request.reference_images.len(),
        request.edit_mode
    );
    let token = CancellationToken::new();
    match state.generator.generate(&request, &token).await {
        Ok(data) => (StatusCode::OK, Json(GenerateImageResponse::from_image(data))).into_response(),
        Err(err) => {
            error!(target: "gateway::generate_image", "Error generating image: {}", err);
            error_response(&err)
        }
    }
}

pub async fn convert_image(
    State(state): State<GatewayState>,
    payload: Result<Json<ConvertImageRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection),
    };
    let url = match validate_http_url(&request.image_url) {
        Ok(url) => url,
        Err(err) => return error_response(&err),
    };
    match fetch_base64(&state.http, url.as_str()).await {
        Ok(base64) => (StatusCode::OK, Json(ConvertImageResponse { base64 })).into_response(),
        Err(err) => {
            warn!(target: "gateway::convert_image", "Converting {} failed: {}", url, err);
            error_response(&err)
        }
    }
}

pub async fn serve_object(
    State(state): State<GatewayState>,
    Path((bucket, object)): Path<(String, String)>,
) -> Response {
    let Some(blobs) = state.blobs.as_ref().filter(|_| bucket == state.bucket) else {
        return json_error(StatusCode::NOT_FOUND, "bucket not found", None, None);
    };
    match blobs.get(&object).await {
        Ok(Some(bytes)) => {
            let mime_type = detect_mime_type(&bytes).unwrap_or("application/octet-stream");
            (StatusCode::OK, [(header::CONTENT_TYPE, mime_type)], bytes).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "object not found", None, None),
        Err(err) => {
            warn!(target: "gateway::serve_object", "Reading {} failed: {}", object, err);
            json_error(StatusCode::BAD_REQUEST, &err.to_string(), None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_urls_are_converted() {
        assert!(validate_http_url("https://example.com/a.png").is_ok());
        assert!(validate_http_url("  ").is_err());
        assert!(validate_http_url("file:///etc/passwd").is_err());
        assert!(validate_http_url("not a url").is_err());
    }

    #[test]
    fn upstream_errors_keep_their_status() {
        let response = error_response(&PipelineError::UpstreamError {
            status: 429,
            body: "quota".to_string(),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let response = error_response(&PipelineError::InvalidRequest("Prompt is required".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
