use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::PipelineError;
use crate::gateway::{ErrorResponse, GenerateImageRequest, GenerateImageResponse, GenerationGateway};

/// Calls a remote gateway's `POST /generate-image`.
#[derive(Clone)]
pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/generate-image", self.base_url)
    }
}

fn error_from_response(status: u16, body: &str) -> PipelineError {
    let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) else {
        return PipelineError::UpstreamError {
            status,
            body: body.to_string(),
        };
    };
    match parsed.code.as_deref() {
        Some("invalid_request") => PipelineError::InvalidRequest(parsed.error),
        Some("no_image_returned") => PipelineError::NoImageReturned,
        _ => PipelineError::UpstreamError {
            status: parsed.status.unwrap_or(status),
            body: parsed.error,
        },
    }
}

#[async_trait]
impl GenerationGateway for GatewayClient {
    async fn generate(
        &self,
        request: &GenerateImageRequest,
        token: &CancellationToken,
    ) -> Result<String, PipelineError> {
        if request.prompt.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("Prompt is required".to_string()));
        }
        debug!(
            target: "gateway_client::generate",
            "POST {} with {} reference images (edit_mode={})",
            self.endpoint(),
            request.reference_images.len(),
            request.edit_mode
        );

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PipelineError::Cancelled),
            res = self.client.post(self.endpoint()).json(request).send() => res?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PipelineError::Cancelled),
            res = response.text() => res?,
        };
        if !status.is_success() {
            error!(target: "gateway_client::generate", "Gateway returned {}: {}", status, body);
            return Err(error_from_response(status.as_u16(), &body));
        }

        let payload: GenerateImageResponse =
            serde_json::from_str(&body).map_err(|err| PipelineError::UpstreamError {
                status: status.as_u16(),
                body: format!("unparseable gateway response: {err}"),
            })?;
        payload.into_image().ok_or(PipelineError::NoImageReturned)
    }
}
