use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::gateway::{GenerateImageRequest, GenerationGateway};
use crate::image_processing::parse_image_data_url;

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Style-guidance references beyond this count are dropped.
pub const MAX_STYLE_REFERENCES: usize = 3;

const TEMPERATURE: f32 = 0.8;
const TOP_K: u32 = 40;
const TOP_P: f32 = 0.95;
const MAX_OUTPUT_TOKENS: u32 = 8192;
const BLOCK_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";
const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub fn edit_instruction(prompt: &str) -> String {
    format!(
        "Edit this ceramic sculpture image with the following changes: {prompt}. \
Maintain the ceramic material properties, clay-like textures, and sculptural form while making the requested modifications. \
Preserve the artistic integrity and craftsmanship details."
    )
}

pub fn generation_instruction(prompt: &str) -> String {
    format!(
        "Generate a high-quality, photorealistic ceramic sculpture image: {prompt}. \
Create detailed clay-like surfaces with natural ceramic textures, professional pottery craftsmanship, and sculptural forms. \
Include realistic glazing effects, surface imperfections, and artistic detailing that shows the handmade ceramic quality."
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    pub safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeminiContent {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    pub response_modalities: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: TEMPERATURE,
            top_k: TOP_K,
            top_p: TOP_P,
            max_output_tokens: MAX_OUTPUT_TOKENS,
            response_modalities: vec!["Text".to_string(), "Image".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

pub fn safety_settings() -> Vec<SafetySetting> {
    HARM_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: category.to_string(),
            threshold: BLOCK_THRESHOLD.to_string(),
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiCandidate {
    pub content: Option<GeminiResponseContent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiResponseContent {
    #[serde(default)]
    pub parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiResponsePart {
    pub text: Option<String>,
    #[serde(rename = "inlineData")]
    pub inline_data: Option<GeminiResponseInlineData>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeminiResponseInlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub data: Option<String>,
}

fn inline_part(data_url: &str) -> Option<GeminiPart> {
    let (mime_type, data) = parse_image_data_url(data_url)?;
    Some(GeminiPart::InlineData {
        inline_data: InlineData {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        },
    })
}

/// Ordered request segments for one call.
///
/// Edit mode with references: the first reference then the edit instruction.
/// Otherwise up to [`MAX_STYLE_REFERENCES`] references then the generation
/// instruction. References that are not `data:image/<subtype>;base64,` URLs are skipped.
pub fn build_parts(prompt: &str, reference_images: &[String], edit_mode: bool) -> Vec<GeminiPart> {
    let mut parts = Vec::new();
    if edit_mode && !reference_images.is_empty() {
        parts.extend(inline_part(&reference_images[0]));
        parts.push(GeminiPart::Text {
            text: edit_instruction(prompt),
        });
    } else {
        parts.extend(
            reference_images
                .iter()
                .take(MAX_STYLE_REFERENCES)
                .filter_map(|reference| inline_part(reference)),
        );
        parts.push(GeminiPart::Text {
            text: generation_instruction(prompt),
        });
    }
    parts
}

pub fn build_request(parts: Vec<GeminiPart>) -> GeminiRequest {
    GeminiRequest {
        contents: vec![GeminiContent {
            role: "user".to_string(),
            parts,
        }],
        generation_config: GenerationConfig::default(),
        safety_settings: safety_settings(),
    }
}

/// First non-empty inline image of the first candidate.
pub fn extract_first_inline_image(response: GeminiResponse) -> Option<String> {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.inline_data)
                .filter_map(|inline| inline.data)
                .find(|data| !data.is_empty())
        })
}

/// Request JSON with inline payloads replaced by a placeholder.
fn redacted_request(request: &GeminiRequest) -> String {
    let mut redacted = request.clone();
    for content in &mut redacted.contents {
        for part in &mut content.parts {
            if let GeminiPart::InlineData { inline_data } = part {
                inline_data.data = format!("[BASE64_DATA {} chars]", inline_data.data.len());
            }
        }
    }
    serde_json::to_string(&redacted).unwrap_or_default()
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_base: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, GEMINI_API_BASE, GEMINI_IMAGE_MODEL)
    }

    pub fn with_endpoint(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    pub async fn generate_image(
        &self,
        prompt: &str,
        reference_images: &[String],
        edit_mode: bool,
        token: &CancellationToken,
    ) -> Result<String, PipelineError> {
        if prompt.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("Prompt is required".to_string()));
        }
        let request = build_request(build_parts(prompt, reference_images, edit_mode));
        debug!(target: "gemini::generate_image", "Request body: {}", redacted_request(&request));

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(target: "gemini::generate_image", "Cancellation token triggered before sending request.");
                return Err(PipelineError::Cancelled);
            }
            res = self
                .client
                .post(self.endpoint())
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send() => res?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(target: "gemini::generate_image", "Cancellation token triggered while reading response.");
                return Err(PipelineError::Cancelled);
            }
            res = response.text() => res,
        };
        if !status.is_success() {
            let body = body.unwrap_or_default();
            error!(target: "gemini::generate_image", "Gemini API error: {} {}", status, body);
            return Err(PipelineError::UpstreamError {
                status: status.as_u16(),
                body,
            });
        }

        let response_text = body?;
        let payload: GeminiResponse = serde_json::from_str(&response_text).map_err(|err| {
            error!(target: "gemini::generate_image", "Failed to parse response: {}", err);
            PipelineError::UpstreamError {
                status: status.as_u16(),
                body: format!("unparseable response: {err}"),
            }
        })?;
        debug!(
            target: "gemini::generate_image",
            "Response: {} candidates, first has {} parts",
            payload.candidates.len(),
            payload
                .candidates
                .first()
                .and_then(|candidate| candidate.content.as_ref())
                .map(|content| content.parts.len())
                .unwrap_or(0)
        );

        let image = extract_first_inline_image(payload).ok_or_else(|| {
            error!(target: "gemini::generate_image", "No image data found in response");
            PipelineError::NoImageReturned
        })?;
        info!(target: "gemini::generate_image", "Image generated ({} base64 chars)", image.len());
        Ok(image)
    }
}

#[async_trait]
impl GenerationGateway for GeminiClient {
    async fn generate(
        &self,
        request: &GenerateImageRequest,
        token: &CancellationToken,
    ) -> Result<String, PipelineError> {
        self.generate_image(
            &request.prompt,
            &request.reference_images,
            request.edit_mode,
            token,
        )
        .await
    }
}
