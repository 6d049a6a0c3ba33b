use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ceramic_imagegen::{
    config::GatewayConfig,
    gateway::{GatewayState, router},
    gemini::GeminiClient,
    storage::LocalBlobStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env()?;
    let generator = Arc::new(GeminiClient::with_endpoint(
        config.gemini_api_key.clone(),
        config.gemini_api_base.clone(),
        config.gemini_model.clone(),
    ));
    let blobs = Arc::new(LocalBlobStore::new(config.blob_dir()));
    let state = GatewayState::new(generator).with_blobs(blobs, config.bucket.clone());

    let tcp_listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(
        "Ceramic image gateway started at http://{} (model {}, objects served as {}/v0/b/{}/o/...)",
        config.bind_address, config.gemini_model, config.public_base_url, config.bucket
    );

    axum::serve(tcp_listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
