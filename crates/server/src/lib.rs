pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use finwise_categorize::{CategorizationEngine, KeywordRules, ModelState, RulesError};
use finwise_ocr::{ImagePreprocessor, OcrBackend, ReceiptPipeline};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::{OcrSettings, ServerSettings, Settings};

pub type SharedPipeline = Arc<ReceiptPipeline<Box<dyn OcrBackend>>>;

/// Read-only state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: SharedPipeline,
    pub categorizer: Arc<CategorizationEngine>,
}

impl AppState {
    pub fn new(
        preprocessor: ImagePreprocessor,
        recognizer: Box<dyn OcrBackend>,
        categorizer: CategorizationEngine,
    ) -> Self {
        let categorizer = Arc::new(categorizer);
        let pipeline = ReceiptPipeline::new(preprocessor, recognizer).with_categorizer(categorizer.clone());
        Self { pipeline: Arc::new(pipeline), categorizer }
    }

    /// Load the classifier (falling back to keywords when absent) and the
    /// keyword table, and pick the OCR backend this binary was built with.
    pub fn from_settings(settings: &Settings) -> Result<Self, RulesError> {
        let rules = match &settings.ml.rules_path {
            Some(path) => KeywordRules::from_file(path)?,
            None => KeywordRules::default(),
        };
        let model = ModelState::load(&settings.ml.models_path);
        let engine = CategorizationEngine::new(model, rules, settings.categorizer.clone());
        tracing::info!("Categorizer ready in {} mode", engine.mode());

        Ok(Self::new(
            ImagePreprocessor::new(settings.preprocess.clone()),
            build_recognizer(&settings.ocr),
            engine,
        ))
    }
}

#[cfg(feature = "tesseract")]
fn build_recognizer(ocr: &OcrSettings) -> Box<dyn OcrBackend> {
    tracing::info!("Using Tesseract backend ({})", ocr.languages);
    Box::new(finwise_ocr::TesseractRecognizer::new(ocr.data_path.clone(), &ocr.languages))
}

#[cfg(not(feature = "tesseract"))]
fn build_recognizer(_ocr: &OcrSettings) -> Box<dyn OcrBackend> {
    tracing::warn!("Built without the `tesseract` feature; receipt OCR requests will fail");
    Box::new(finwise_ocr::UnavailableRecognizer)
}

pub fn router(state: AppState, server: &ServerSettings) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health_check))
        .route("/api/v1/receipts/ocr", post(routes::receipts::ocr_receipt))
        .route("/api/v1/ml/categorize", post(routes::ml::categorize))
        .route("/api/v1/ml/categorize-batch", post(routes::ml::categorize_batch))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(server.body_limit_bytes))
        .layer(cors_layer(&server.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.trim().parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid allowed origin: {origin}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}
