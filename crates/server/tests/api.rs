use std::io::Cursor;
use std::path::Path;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use finwise_categorize::{CategorizationEngine, CategorizerConfig, KeywordRules, ModelState};
use finwise_ocr::{ImagePreprocessor, MockRecognizer, OcrBackend, PreprocessConfig, UnavailableRecognizer};
use finwise_server::config::ServerSettings;
use finwise_server::{router, AppState};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use serde_json::{json, Value};
use tower::ServiceExt;

const RECEIPT_TEXT: &str = "ПЯТЕРОЧКА\nЧек от 15.01.2024\nХлеб белый 45.50\nМолоко 89.90 x 2 = 179.80\nИТОГО 225.30";

fn fast_preprocessor() -> ImagePreprocessor {
    ImagePreprocessor::new(PreprocessConfig {
        min_dimension: 64,
        denoise_template_window: 3,
        denoise_search_window: 3,
        ..PreprocessConfig::default()
    })
}

fn app_with(recognizer: Box<dyn OcrBackend>, engine: CategorizationEngine) -> Router {
    let state = AppState::new(fast_preprocessor(), recognizer, engine);
    router(state, &ServerSettings::default())
}

fn app() -> Router {
    app_with(Box::new(MockRecognizer::new(RECEIPT_TEXT)), CategorizationEngine::fallback_only())
}

fn image_base64() -> String {
    let img: GrayImage = ImageBuffer::from_fn(48, 32, |_, y| Luma([if y % 8 < 2 { 20 } else { 230 }]));
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    STANDARD.encode(buf)
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn write_model(dir: &Path) {
    std::fs::write(
        dir.join("vectorizer.json"),
        r#"{"vocabulary": {"такси": 0, "хлеб": 1}, "idf": [1.5, 1.8], "ngram_range": [1, 1]}"#,
    )
    .unwrap();
    std::fs::write(
        dir.join("categorization_model.json"),
        r#"{"trees": [{"nodes": [
            {"feature": 0, "threshold": 0.0, "left": 1, "right": 2},
            {"value": [7.0, 2.0, 1.0]},
            {"value": [0.0, 1.0, 9.0]}
        ]}]}"#,
    )
    .unwrap();
    std::fs::write(dir.join("label_encoder.json"), r#"{"classes": ["Продукты", "Прочее", "Такси"]}"#).unwrap();
}

// ── health ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_fallback_mode() {
    let (status, body) = send(app(), Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy", "model": "fallback"}));
}

#[tokio::test]
async fn health_reports_loaded_model() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());
    let model = ModelState::load(dir.path());
    assert!(model.is_loaded());
    let engine = CategorizationEngine::new(model, KeywordRules::default(), CategorizerConfig::default());

    let app = app_with(Box::new(MockRecognizer::new("")), engine);
    let (_, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(body["model"], "loaded");
}

// ── receipts ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ocr_returns_structured_receipt() {
    let (status, body) = send(app(), post_json("/api/v1/receipts/ocr", json!({"image_base64": image_base64()}))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["total"], 225.3);
    assert_eq!(body["date"], "2024-01-15");
    assert_eq!(body["retailer"], "ПЯТЕРОЧКА");
    assert_eq!(body["raw_text"], RECEIPT_TEXT);

    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["name"], "Хлеб белый");
    assert_eq!(items[0]["sum"], 45.5);
    assert_eq!(items[0]["quantity"], 1);
    assert_eq!(items[1]["price"], 89.9);
    assert_eq!(items[1]["quantity"], 2);
    assert!(items[0].get("category").is_none());
}

#[tokio::test]
async fn ocr_can_categorize_items() {
    let payload = json!({
        "image_base64": format!("data:image/png;base64,{}", image_base64()),
        "categorize_items": true,
    });
    let (status, body) = send(app(), post_json("/api/v1/receipts/ocr", payload)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    for item in body["items"].as_array().unwrap() {
        assert_eq!(item["category"], "Продукты");
    }
}

#[tokio::test]
async fn ocr_rejects_undecodable_image() {
    let (status, body) = send(app(), post_json("/api/v1/receipts/ocr", json!({"image_base64": "%%%"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("base64"));

    let not_image = STANDARD.encode(b"hello world");
    let (status, body) = send(app(), post_json("/api/v1/receipts/ocr", json!({"image_base64": not_image}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn ocr_rejects_empty_payload() {
    let (status, body) = send(app(), post_json("/api/v1/receipts/ocr", json!({"image_base64": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "image_base64 is empty"}));
}

#[tokio::test]
async fn ocr_engine_failure_is_bad_gateway() {
    let app = app_with(Box::new(UnavailableRecognizer), CategorizationEngine::fallback_only());
    let (status, body) = send(app, post_json("/api/v1/receipts/ocr", json!({"image_base64": image_base64()}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.get("total").is_none());
    assert!(body["error"].is_string());
}

// ── ml ────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn categorize_with_keyword_fallback() {
    let (status, body) = send(
        app(),
        post_json("/api/v1/ml/categorize", json!({"description": "Пятерочка у дома", "amount": 512.4})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["category"], "Продукты");
    assert!((body["confidence"].as_f64().unwrap() - 0.70).abs() < 1e-6);
    assert_eq!(body["alternatives"][0]["category"], "Прочее");
    assert!(body["processing_time_ms"].is_u64());
}

#[tokio::test]
async fn categorize_unknown_description_defaults_to_other() {
    let (_, body) = send(
        app(),
        post_json("/api/v1/ml/categorize", json!({"description": "xyz", "amount": 1.0, "items": []})),
    )
    .await;
    assert_eq!(body["category"], "Прочее");
    assert!((body["confidence"].as_f64().unwrap() - 0.30).abs() < 1e-6);
    assert_eq!(body["alternatives"], json!([]));
}

#[tokio::test]
async fn categorize_uses_model_hints_when_loaded() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());
    let engine = CategorizationEngine::new(
        ModelState::load(dir.path()),
        KeywordRules::default(),
        CategorizerConfig::default(),
    );
    let app = app_with(Box::new(MockRecognizer::new("")), engine);
    let (_, body) = send(
        app,
        post_json(
            "/api/v1/ml/categorize",
            json!({"description": "Поездка", "amount": 350, "merchant_name": "Такси Максим"}),
        ),
    )
    .await;
    assert_eq!(body["category"], "Такси");
    assert!((body["confidence"].as_f64().unwrap() - 0.9).abs() < 1e-6);
}

#[tokio::test]
async fn categorize_batch_preserves_order() {
    let batch = json!([
        {"description": "Яндекс Такси", "amount": 300},
        {"description": "Аптека Ригла", "amount": 820.5},
        {"description": "непонятно", "amount": 10},
    ]);
    let (status, body) = send(app(), post_json("/api/v1/ml/categorize-batch", batch)).await;
    assert_eq!(status, StatusCode::OK);
    let categories: Vec<_> = body.as_array().unwrap().iter().map(|r| r["category"].clone()).collect();
    assert_eq!(categories, [json!("Такси"), json!("Аптека"), json!("Прочее")]);
}

#[tokio::test]
async fn malformed_json_is_client_error() {
    let req = Request::post("/api/v1/ml/categorize")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = app().oneshot(req).await.unwrap();
    assert!(resp.status().is_client_error());
}
