use std::env;
use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::gemini::{GEMINI_API_BASE, GEMINI_IMAGE_MODEL};
use crate::storage::metadata::DEFAULT_GENERATED_LIMIT;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_BUCKET: &str = "ceramic-imagegen";

/// Settings for the `ceramic-gateway` binary, read from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_api_base: String,
    pub storage_dir: PathBuf,
    pub public_base_url: String,
    pub bucket: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = get("GATEWAY_PORT")
            .and_then(|value| value.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let bind_address = format!("0.0.0.0:{port}");
        let gemini_api_key = get("GEMINI_API_KEY")
            .map(|value| value.trim().to_string())
            .ok_or_else(|| anyhow!("missing GEMINI_API_KEY"))?;
        let storage_dir = get("STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_storage_dir);
        let public_base_url = normalize_base_url(
            &get("PUBLIC_BASE_URL").unwrap_or_else(|| format!("127.0.0.1:{port}")),
        );

        Ok(Self {
            bind_address,
            gemini_api_key,
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| GEMINI_IMAGE_MODEL.to_string()),
            gemini_api_base: get("GEMINI_API_BASE").unwrap_or_else(|| GEMINI_API_BASE.to_string()),
            storage_dir,
            public_base_url,
            bucket: get("STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
        })
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.storage_dir.join("blobs")
    }
}

/// Settings for a pipeline talking to a running gateway.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub gateway_url: String,
    /// `POST /convert-image` endpoint tried first by the encoder.
    pub convert_endpoint: Option<String>,
    pub generated_limit: usize,
    /// Initial `isActive` of freshly generated images and their mirrors.
    pub activate_generated: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::for_gateway(format!("http://127.0.0.1:{DEFAULT_PORT}"))
    }
}

impl PipelineConfig {
    pub fn for_gateway(gateway_url: impl Into<String>) -> Self {
        let gateway_url = normalize_base_url(&gateway_url.into());
        Self {
            convert_endpoint: Some(format!("{gateway_url}/convert-image")),
            gateway_url,
            generated_limit: DEFAULT_GENERATED_LIMIT,
            activate_generated: true,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("ceramic-imagegen");
    base
}

/// Adds `http://` when no scheme is given and collapses doubled schemes.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let mut base = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    for (doubled, single) in [
        ("http://http://", "http://"),
        ("https://https://", "https://"),
        ("http://https://", "https://"),
        ("https://http://", "http://"),
    ] {
        while base.starts_with(doubled) {
            base = base.replacen(doubled, single, 1);
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = GatewayConfig::from_lookup(lookup(&[("GEMINI_API_KEY", "k")])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.public_base_url, "http://127.0.0.1:3000");
        assert_eq!(config.gemini_model, GEMINI_IMAGE_MODEL);
        assert_eq!(config.bucket, "ceramic-imagegen");
    }

    #[test]
    fn api_key_is_required() {
        assert!(GatewayConfig::from_lookup(lookup(&[])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("GEMINI_API_KEY", "  ")])).is_err());
    }

    #[test]
    fn overrides_are_read() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "k"),
            ("GATEWAY_PORT", "8080"),
            ("PUBLIC_BASE_URL", "https://images.example.com/"),
            ("STORAGE_DIR", "/tmp/ceramics"),
        ]))
        .unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.public_base_url, "https://images.example.com");
        assert_eq!(config.blob_dir(), PathBuf::from("/tmp/ceramics/blobs"));
    }

    #[test]
    fn base_urls_are_normalized() {
        assert_eq!(normalize_base_url("localhost:3000"), "http://localhost:3000");
        assert_eq!(normalize_base_url("http://https://a.com/"), "https://a.com");
        assert_eq!(normalize_base_url("http://http://a.com"), "http://a.com");
        let pipeline = PipelineConfig::for_gateway("gw.local:3000/");
        assert_eq!(pipeline.gateway_url, "http://gw.local:3000");
        assert_eq!(pipeline.convert_endpoint.as_deref(), Some("http://gw.local:3000/convert-image"));
    }
}
