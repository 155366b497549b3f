use axum::extract::State;
use axum::Json;
use finwise_core::{LineItem, ReceiptDocument};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct OcrRequest {
    /// JPEG/PNG/WEBP bytes, base64, optionally as a data URI.
    pub image_base64: String,
    #[serde(default)]
    pub categorize_items: bool,
}

#[derive(Debug, Serialize)]
pub struct ReceiptItemResponse {
    pub name: String,
    pub price: f64,
    pub quantity: u32,
    pub sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl From<LineItem> for ReceiptItemResponse {
    fn from(item: LineItem) -> Self {
        Self {
            name: item.name,
            price: item.unit_price.to_f64(),
            quantity: item.quantity,
            sum: item.line_sum.to_f64(),
            category: item.category,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OcrResponse {
    pub total: Option<f64>,
    /// `YYYY-MM-DD`
    pub date: Option<String>,
    pub retailer: Option<String>,
    pub items: Vec<ReceiptItemResponse>,
    pub raw_text: String,
}

impl From<ReceiptDocument> for OcrResponse {
    fn from(doc: ReceiptDocument) -> Self {
        Self {
            total: doc.total.map(|t| t.to_f64()),
            date: doc.date.map(|d| d.format("%Y-%m-%d").to_string()),
            retailer: doc.retailer,
            items: doc.items.into_iter().map(Into::into).collect(),
            raw_text: doc.raw_text,
        }
    }
}

pub async fn ocr_receipt(
    State(state): State<AppState>,
    Json(req): Json<OcrRequest>,
) -> Result<Json<OcrResponse>, ApiError> {
    if req.image_base64.trim().is_empty() {
        return Err(ApiError::BadRequest("image_base64 is empty".to_string()));
    }
    tracing::info!("OCR request: {} base64 chars", req.image_base64.len());
    let doc = state
        .pipeline
        .clone()
        .recognize_blocking(req.image_base64, req.categorize_items)
        .await?;
    Ok(Json(doc.into()))
}
