//! The `/generate-image` proxy: wire types, the HTTP handlers and a client for it.

pub mod client;
pub mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

pub use client::GatewayClient;
pub use server::{GatewayState, router};

/// Anything that can turn a prompt and inline references into one base64 image.
#[async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate(
        &self,
        request: &GenerateImageRequest,
        token: &CancellationToken,
    ) -> Result<String, PipelineError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImageRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub reference_images: Vec<String>,
    #[serde(default)]
    pub edit_mode: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateImageResponse {
    #[serde(default)]
    pub candidates: Vec<WireCandidate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireCandidate {
    #[serde(default)]
    pub content: Option<WireContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireContent {
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WirePart {
    #[serde(rename = "inlineData", default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<WireInlineData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireInlineData {
    #[serde(default)]
    pub data: String,
}

impl GenerateImageResponse {
    /// Exactly one candidate with one part carrying the image.
    pub fn from_image(data: String) -> Self {
        Self {
            candidates: vec![WireCandidate {
                content: Some(WireContent {
                    parts: vec![WirePart {
                        inline_data: Some(WireInlineData { data }),
                    }],
                }),
            }],
        }
    }

    /// Image payload of the first part of the first candidate, if non-empty.
    pub fn into_image(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .inline_data
            .map(|inline| inline.data)
            .filter(|data| !data.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertImageRequest {
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertImageResponse {
    pub base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Upstream HTTP status, present for upstream failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}
