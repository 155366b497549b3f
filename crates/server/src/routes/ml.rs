use std::time::Instant;

use axum::extract::State;
use axum::Json;
use finwise_core::{CategorizableTransaction, CategorizationResult, Money};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CategorizeRequest {
    pub description: String,
    pub amount: f64,
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub items: Vec<String>,
}

impl From<CategorizeRequest> for CategorizableTransaction {
    fn from(req: CategorizeRequest) -> Self {
        let tx = CategorizableTransaction::new(req.description, Money::from_f64(req.amount).unwrap_or_default())
            .with_items(req.items);
        match req.merchant_name {
            Some(merchant) => tx.with_merchant(merchant),
            None => tx,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CategorizeResponse {
    #[serde(flatten)]
    pub result: CategorizationResult,
    pub processing_time_ms: u64,
}

pub async fn categorize(
    State(state): State<AppState>,
    Json(req): Json<CategorizeRequest>,
) -> Json<CategorizeResponse> {
    let started = Instant::now();
    let result = state.categorizer.categorize(&req.into());
    Json(CategorizeResponse { result, processing_time_ms: started.elapsed().as_millis() as u64 })
}

pub async fn categorize_batch(
    State(state): State<AppState>,
    Json(reqs): Json<Vec<CategorizeRequest>>,
) -> Json<Vec<CategorizeResponse>> {
    let txs: Vec<CategorizableTransaction> = reqs.into_iter().map(Into::into).collect();
    tracing::info!("Batch categorization of {} transactions", txs.len());
    let results = txs
        .iter()
        .map(|tx| {
            let started = Instant::now();
            let result = state.categorizer.categorize(tx);
            CategorizeResponse { result, processing_time_ms: started.elapsed().as_millis() as u64 }
        })
        .collect();
    Json(results)
}
