use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Request};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::PipelineError;
use crate::gateway::{ConvertImageRequest, ConvertImageResponse};
use crate::image_processing::{self, encode_base64};

/// Upper bound on a single remote image fetch, body included.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for fetching remote image content, bounded by `timeout`.
pub fn fetch_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

/// One way of turning a remote image URL into base64.
#[async_trait]
pub trait EncodeStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_base64(&self, url: &str) -> Result<String, PipelineError>;
}

/// GET `url` and base64 the body. Shared with the gateway's conversion endpoint.
pub async fn fetch_base64(client: &Client, url: &str) -> Result<String, PipelineError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::EncodingError(format!(
            "fetch {url} failed: HTTP {status}"
        )));
    }
    let bytes = response.bytes().await?;
    Ok(encode_base64(&bytes))
}

/// Asks the gateway's `POST /convert-image` to fetch the resource server side.
pub struct ProxyStrategy {
    client: Client,
    endpoint: String,
}

impl ProxyStrategy {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl EncodeStrategy for ProxyStrategy {
    fn name(&self) -> &'static str {
        "conversion-proxy"
    }

    async fn fetch_base64(&self, url: &str) -> Result<String, PipelineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ConvertImageRequest {
                image_url: url.to_string(),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::EncodingError(format!(
                "conversion proxy returned HTTP {status}"
            )));
        }
        let payload: ConvertImageResponse = response.json().await?;
        if payload.base64.is_empty() {
            return Err(PipelineError::EncodingError(
                "conversion proxy returned empty data".to_string(),
            ));
        }
        Ok(payload.base64)
    }
}

pub struct DirectFetchStrategy {
    client: Client,
}

impl DirectFetchStrategy {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EncodeStrategy for DirectFetchStrategy {
    fn name(&self) -> &'static str {
        "direct-fetch"
    }

    async fn fetch_base64(&self, url: &str) -> Result<String, PipelineError> {
        fetch_base64(&self.client, url).await
    }
}

/// Last resort: a bare HTTP/1.1 client executing a hand-built request.
pub struct RawHttpStrategy {
    client: Client,
}

impl RawHttpStrategy {
    pub fn new() -> Result<Self, PipelineError> {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .http1_only()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EncodeStrategy for RawHttpStrategy {
    fn name(&self) -> &'static str {
        "raw-http"
    }

    async fn fetch_base64(&self, url: &str) -> Result<String, PipelineError> {
        let parsed = Url::parse(url)
            .map_err(|err| PipelineError::EncodingError(format!("invalid url {url}: {err}")))?;
        let response = self.client.execute(Request::new(Method::GET, parsed)).await?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(PipelineError::EncodingError(format!(
                "raw request failed with status: {status}"
            )));
        }
        let bytes = response.bytes().await?;
        Ok(encode_base64(&bytes))
    }
}

/// Converts image URLs to base64 by trying each strategy in order.
pub struct ImageEncoder {
    strategies: Vec<Box<dyn EncodeStrategy>>,
}

impl ImageEncoder {
    pub fn new(strategies: Vec<Box<dyn EncodeStrategy>>) -> Self {
        Self { strategies }
    }

    /// Proxy (when configured), then direct fetch, then the raw client.
    pub fn with_default_chain(proxy_endpoint: Option<&str>) -> Result<Self, PipelineError> {
        let client = fetch_client(FETCH_TIMEOUT)?;
        let mut strategies: Vec<Box<dyn EncodeStrategy>> = Vec::new();
        if let Some(endpoint) = proxy_endpoint {
            strategies.push(Box::new(ProxyStrategy::new(client.clone(), endpoint)));
        }
        strategies.push(Box::new(DirectFetchStrategy::new(client)));
        strategies.push(Box::new(RawHttpStrategy::new()?));
        Ok(Self::new(strategies))
    }

    pub async fn to_base64(
        &self,
        source_url: &str,
        token: &CancellationToken,
    ) -> Result<String, PipelineError> {
        if image_processing::is_data_url(source_url) {
            return image_processing::data_url_payload(source_url).map(str::to_string);
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            debug!(target: "encoding::to_base64", "Trying {} for {}", strategy.name(), source_url);
            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                res = strategy.fetch_base64(source_url) => res,
            };
            match attempt {
                Ok(data) => {
                    info!(
                        target: "encoding::to_base64",
                        "{} succeeded, base64 length: {}",
                        strategy.name(),
                        data.len()
                    );
                    return Ok(data);
                }
                Err(err) => {
                    warn!(target: "encoding::to_base64", "{} failed: {}", strategy.name(), err);
                    failures.push(format!("{}: {err}", strategy.name()));
                }
            }
        }
        Err(PipelineError::EncodingError(if failures.is_empty() {
            "no conversion strategy configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        result: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EncodeStrategy for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_base64(&self, _url: &str) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .map(str::to_string)
                .ok_or_else(|| PipelineError::EncodingError(format!("{} down", self.name)))
        }
    }

    fn scripted(name: &'static str, result: Option<&'static str>) -> (Box<dyn EncodeStrategy>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                name,
                result,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn data_urls_never_touch_the_network() {
        let (strategy, calls) = scripted("proxy", Some("NOPE"));
        let encoder = ImageEncoder::new(vec![strategy]);
        let token = CancellationToken::new();

        let payload = encoder
            .to_base64("data:image/png;base64,iVBORw0KGgo=", &token)
            .await
            .unwrap();
        assert_eq!(payload, "iVBORw0KGgo=");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(matches!(
            encoder.to_base64("data:image/png;base64", &token).await,
            Err(PipelineError::MalformedDataUrl)
        ));
    }

    #[tokio::test]
    async fn strategies_run_in_order_until_one_succeeds() {
        let (proxy, proxy_calls) = scripted("proxy", None);
        let (direct, direct_calls) = scripted("direct", Some("DIRECT"));
        let (raw, raw_calls) = scripted("raw", Some("RAW"));
        let encoder = ImageEncoder::new(vec![proxy, direct, raw]);

        let payload = encoder
            .to_base64("https://example.com/a.png", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload, "DIRECT");
        assert_eq!(proxy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(direct_calls.load(Ordering::SeqCst), 1);
        assert_eq!(raw_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn every_call_reruns_the_chain() {
        let (proxy, proxy_calls) = scripted("proxy", Some("P"));
        let encoder = ImageEncoder::new(vec![proxy]);
        let token = CancellationToken::new();
        encoder.to_base64("https://example.com/a.png", &token).await.unwrap();
        encoder.to_base64("https://example.com/a.png", &token).await.unwrap();
        assert_eq!(proxy_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn all_failures_yield_encoding_error() {
        let (proxy, _) = scripted("proxy", None);
        let (direct, _) = scripted("direct", None);
        let encoder = ImageEncoder::new(vec![proxy, direct]);
        match encoder
            .to_base64("https://example.com/a.png", &CancellationToken::new())
            .await
        {
            Err(PipelineError::EncodingError(details)) => {
                assert!(details.contains("proxy"));
                assert!(details.contains("direct"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_chain() {
        let (proxy, calls) = scripted("proxy", Some("P"));
        let encoder = ImageEncoder::new(vec![proxy]);
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            encoder.to_base64("https://example.com/a.png", &token).await,
            Err(PipelineError::Cancelled)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetches_give_up_on_stalled_bodies() {
        let short = Duration::from_millis(300);

        let base = crate::image_processing::test_support::stalled_server().await;
        let direct = DirectFetchStrategy::new(fetch_client(short).unwrap());
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            direct.fetch_base64(&format!("{base}/vase.png")),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(PipelineError::Network(_))));

        let base = crate::image_processing::test_support::stalled_server().await;
        let raw = RawHttpStrategy::with_timeout(short).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            raw.fetch_base64(&format!("{base}/vase.png")),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(PipelineError::Network(_))));
    }
}
