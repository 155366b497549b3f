pub mod ml;
pub mod receipts;

use axum::extract::State;
use axum::Json;
use finwise_categorize::CategorizationMode;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// `loaded` when the trained classifier is in use, `fallback` otherwise.
    pub model: &'static str,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let model = match state.categorizer.mode() {
        CategorizationMode::Model => "loaded",
        CategorizationMode::Fallback => "fallback",
    };
    Json(HealthResponse { status: "healthy", model })
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub app: &'static str,
    pub version: &'static str,
    pub status: &'static str,
}

pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        app: "FinWise API",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}
