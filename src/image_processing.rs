use base64::{Engine, engine::general_purpose::STANDARD};
use image::{GenericImageView, ImageFormat};

use crate::error::PipelineError;

/// Dimensions and sniffed type of a decoded image payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
    pub size: usize,
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn mime_to_format(mime_type: &str) -> Option<ImageFormat> {
    match mime_type {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::WebP),
        "image/bmp" => Some(ImageFormat::Bmp),
        _ => None,
    }
}

pub fn is_data_url(url: &str) -> bool {
    url.starts_with("data:")
}

/// Payload after the first comma of an inline data URL.
pub fn data_url_payload(url: &str) -> Result<&str, PipelineError> {
    url.split_once(',')
        .map(|(_, payload)| payload)
        .ok_or(PipelineError::MalformedDataUrl)
}

/// Strict `data:image/<subtype>;base64,<payload>` split into `(mime, payload)`.
///
/// The subtype must be lowercase ASCII letters; anything else yields `None`.
pub fn parse_image_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    let subtype = mime.strip_prefix("image/")?;
    if subtype.is_empty() || !subtype.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }
    Some((mime, payload))
}

pub fn to_data_url(mime_type: &str, base64_data: &str) -> String {
    format!("data:{mime_type};base64,{base64_data}")
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, PipelineError> {
    STANDARD
        .decode(data.trim())
        .map_err(|err| PipelineError::InvalidImageData(format!("base64 decode failed: {err}")))
}

/// Decode a base64 image fully, rejecting anything that is not a displayable image.
pub fn decode_base64_image(data: &str) -> Result<ImageInfo, PipelineError> {
    if data.trim().is_empty() {
        return Err(PipelineError::InvalidImageData("empty image payload".to_string()));
    }
    let bytes = decode_base64(data)?;
    let mime_type = detect_mime_type(&bytes)
        .ok_or_else(|| PipelineError::InvalidImageData("unrecognized image format".to_string()))?;
    let format = mime_to_format(mime_type)
        .ok_or_else(|| PipelineError::InvalidImageData(format!("unsupported mime type: {mime_type}")))?;
    let image = image::load_from_memory_with_format(&bytes, format)
        .map_err(|err| PipelineError::InvalidImageData(format!("decode image failed: {err}")))?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidImageData("image has no pixels".to_string()));
    }
    Ok(ImageInfo {
        width,
        height,
        mime_type,
        size: bytes.len(),
    })
}
