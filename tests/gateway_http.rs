use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, Uri, header},
    routing::get,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ceramic_imagegen::{
    encoding::{ImageEncoder, ProxyStrategy},
    error::PipelineError,
    gateway::{GatewayClient, GatewayState, GenerateImageRequest, GenerationGateway, router},
    gemini::GeminiClient,
    image_processing::{encode_base64, to_data_url},
    storage::{Folder, LocalBlobStore, ObjectStore},
};

#[derive(Clone)]
struct Upstream {
    calls: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    status: StatusCode,
    body: String,
}

impl Upstream {
    fn replying(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            status,
            body: body.into(),
        }
    }

    fn calls(&self) -> Vec<(String, Option<String>, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

async fn fake_generate_content(
    State(upstream): State<Upstream>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    let api_key = headers
        .get("x-goog-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    upstream
        .calls
        .lock()
        .unwrap()
        .push((uri.path().to_string(), api_key, body));
    (
        upstream.status,
        [(header::CONTENT_TYPE, "application/json")],
        upstream.body.clone(),
    )
}

fn png_bytes() -> Vec<u8> {
    let pixels = image::RgbaImage::from_pixel(3, 3, image::Rgba([200, 120, 60, 255]));
    let mut output = Vec::new();
    image::DynamicImage::ImageRgba8(pixels)
        .write_to(&mut std::io::Cursor::new(&mut output), image::ImageFormat::Png)
        .unwrap();
    output
}

fn image_reply(data: &str) -> String {
    json!({
        "candidates": [{
            "content": {
                "parts": [
                    { "text": "Here is your sculpture." },
                    { "inlineData": { "mimeType": "image/png", "data": data } }
                ]
            }
        }]
    })
    .to_string()
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{address}")
}

struct Gateway {
    url: String,
    client: GatewayClient,
    _dir: tempfile::TempDir,
    blobs: Arc<LocalBlobStore>,
}

async fn start_gateway(upstream: &Upstream) -> Gateway {
    let upstream_url = spawn(
        Router::new()
            .fallback(fake_generate_content)
            .with_state(upstream.clone()),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(LocalBlobStore::new(dir.path().to_path_buf()));
    let generator = Arc::new(GeminiClient::with_endpoint("test-key", upstream_url, "test-model"));
    let state = GatewayState::new(generator).with_blobs(blobs.clone(), "ceramics");
    let url = spawn(router(state)).await;
    Gateway {
        client: GatewayClient::new(url.clone()),
        url,
        _dir: dir,
        blobs,
    }
}

fn request(prompt: &str, references: Vec<String>, edit_mode: bool) -> GenerateImageRequest {
    GenerateImageRequest {
        prompt: prompt.to_string(),
        reference_images: references,
        edit_mode,
    }
}

fn parts(body: &Value) -> Vec<Value> {
    body["contents"][0]["parts"].as_array().unwrap().clone()
}

#[tokio::test]
async fn prompt_only_request_has_a_single_text_part() {
    let png = encode_base64(&png_bytes());
    let upstream = Upstream::replying(StatusCode::OK, image_reply(&png));
    let gateway = start_gateway(&upstream).await;

    let image = gateway
        .client
        .generate(&request("blue glaze vase", vec![], false), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(image, png);

    let calls = upstream.calls();
    assert_eq!(calls.len(), 1);
    let (path, api_key, body) = &calls[0];
    assert_eq!(path, "/models/test-model:generateContent");
    assert_eq!(api_key.as_deref(), Some("test-key"));

    let parts = parts(body);
    assert_eq!(parts.len(), 1);
    let text = parts[0]["text"].as_str().unwrap();
    assert!(text.contains("blue glaze vase"));
    assert!(text.contains("ceramic"));

    assert_eq!(body["safetySettings"].as_array().unwrap().len(), 4);
    assert_eq!(body["generationConfig"]["topK"], 40);
    assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
}

#[tokio::test]
async fn style_references_are_capped_at_three() {
    let png = encode_base64(&png_bytes());
    let upstream = Upstream::replying(StatusCode::OK, image_reply(&png));
    let gateway = start_gateway(&upstream).await;

    let references = (0..5).map(|_| to_data_url("image/jpeg", &png)).collect();
    gateway
        .client
        .generate(&request("speckled bowl", references, false), &CancellationToken::new())
        .await
        .unwrap();

    let parts = parts(&upstream.calls()[0].2);
    let images = parts.iter().filter(|part| part.get("inlineData").is_some()).count();
    assert_eq!(images, 3);
    assert!(parts.last().unwrap().get("text").is_some());
}

#[tokio::test]
async fn edit_mode_leads_with_the_first_reference() {
    let png = encode_base64(&png_bytes());
    let upstream = Upstream::replying(StatusCode::OK, image_reply(&png));
    let gateway = start_gateway(&upstream).await;

    let references = vec![
        "data:image/png;base64,Rklyc3Q=".to_string(),
        "data:image/png;base64,U2Vjb25k".to_string(),
    ];
    gateway
        .client
        .generate(&request("add a spout", references, true), &CancellationToken::new())
        .await
        .unwrap();

    let parts = parts(&upstream.calls()[0].2);
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0]["inlineData"]["data"], "Rklyc3Q=");
    assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
    assert!(parts[1]["text"].as_str().unwrap().contains("add a spout"));
}

#[tokio::test]
async fn upstream_failures_surface_status_and_body() {
    let upstream = Upstream::replying(StatusCode::INTERNAL_SERVER_ERROR, "model overloaded");
    let gateway = start_gateway(&upstream).await;

    let result = gateway
        .client
        .generate(&request("vase", vec![], false), &CancellationToken::new())
        .await;
    match result {
        Err(PipelineError::UpstreamError { status, body }) => {
            assert_eq!(status, 500);
            assert!(body.contains("model overloaded"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(upstream.calls().len(), 1);
}

#[tokio::test]
async fn responses_without_an_image_are_rejected() {
    let upstream = Upstream::replying(StatusCode::OK, json!({ "candidates": [] }).to_string());
    let gateway = start_gateway(&upstream).await;
    let result = gateway
        .client
        .generate(&request("vase", vec![], false), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(PipelineError::NoImageReturned)));

    let empty = Upstream::replying(StatusCode::OK, image_reply(""));
    let gateway = start_gateway(&empty).await;
    let result = gateway
        .client
        .generate(&request("vase", vec![], false), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(PipelineError::NoImageReturned)));
}

#[tokio::test]
async fn empty_prompt_is_a_bad_request() {
    let upstream = Upstream::replying(StatusCode::OK, image_reply("AAAA"));
    let gateway = start_gateway(&upstream).await;

    let response = reqwest::Client::new()
        .post(format!("{}/generate-image", gateway.url))
        .json(&json!({ "prompt": "  ", "referenceImages": [], "editMode": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Prompt is required");
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn malformed_bodies_get_json_errors() {
    let upstream = Upstream::replying(StatusCode::OK, image_reply("AAAA"));
    let gateway = start_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/generate-image", gateway.url))
        .json(&json!({ "prompt": "vase", "referenceImages": "not-a-list" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("referenceImages"));
    assert_eq!(body["code"], "invalid_request");

    let response = client
        .post(format!("{}/convert-image", gateway.url))
        .header(header::CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_request");
    assert!(upstream.calls().is_empty());
}

#[tokio::test]
async fn convert_image_fetches_remote_content() {
    let upstream = Upstream::replying(StatusCode::OK, image_reply("AAAA"));
    let gateway = start_gateway(&upstream).await;
    let bytes = png_bytes();
    let served = bytes.clone();
    let assets = spawn(Router::new().route("/vase.png", get(move || async move { served }))).await;

    let encoder = ImageEncoder::new(vec![Box::new(ProxyStrategy::new(
        reqwest::Client::new(),
        format!("{}/convert-image", gateway.url),
    ))]);
    let payload = encoder
        .to_base64(&format!("{assets}/vase.png"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(payload, encode_base64(&bytes));

    let response = reqwest::Client::new()
        .post(format!("{}/convert-image", gateway.url))
        .json(&json!({ "imageUrl": "file:///etc/hosts" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn uploaded_objects_are_publicly_fetchable() {
    let upstream = Upstream::replying(StatusCode::OK, image_reply("AAAA"));
    let gateway = start_gateway(&upstream).await;
    let objects = ObjectStore::new(gateway.blobs.clone(), &gateway.url, "ceramics").unwrap();

    let bytes = png_bytes();
    let url = objects
        .upload(&bytes, "glazed vase.png", Folder::References)
        .await
        .unwrap();
    assert!(objects.is_managed_url(&url));

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "image/png"
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), bytes);

    let missing = reqwest::get(url.replace("/b/ceramics/", "/b/other/")).await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    objects.delete(&url).await;
    let gone = reqwest::get(&url).await.unwrap();
    assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);
}
