use std::sync::Arc;
use std::time::Instant;

use finwise_categorize::CategorizationEngine;
use finwise_core::{CategorizableTransaction, ReceiptDocument};
use image::GrayImage;
use thiserror::Error;
use tracing::{debug, info};

use crate::extract::Extractor;
use crate::preprocess::{ImagePreprocessor, PreprocessError};
use crate::recognizer::{OcrBackend, OcrError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Image preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
    #[error("Recognition task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Orchestrates: decode → preprocess → OCR → parse → (optional) categorize.
///
/// Recognition is CPU-bound and synchronous; async callers go through
/// [`ReceiptPipeline::recognize_blocking`].
pub struct ReceiptPipeline<R: OcrBackend> {
    preprocessor: ImagePreprocessor,
    recognizer: R,
    categorizer: Option<Arc<CategorizationEngine>>,
}

impl<R: OcrBackend> ReceiptPipeline<R> {
    pub fn new(preprocessor: ImagePreprocessor, recognizer: R) -> Self {
        Self { preprocessor, recognizer, categorizer: None }
    }

    /// Attach an engine used to label line items when a caller asks for it.
    pub fn with_categorizer(mut self, engine: Arc<CategorizationEngine>) -> Self {
        self.categorizer = Some(engine);
        self
    }

    /// Base64 payload (optionally a data URI) → structured receipt.
    pub fn recognize_base64(&self, payload: &str, categorize: bool) -> Result<ReceiptDocument, PipelineError> {
        let started = Instant::now();
        let image = self.preprocessor.preprocess_base64(payload)?;
        self.finish(&image, categorize, started)
    }

    /// Encoded image bytes → structured receipt.
    pub fn recognize_bytes(&self, data: &[u8], categorize: bool) -> Result<ReceiptDocument, PipelineError> {
        let started = Instant::now();
        let image = self.preprocessor.preprocess(data)?;
        self.finish(&image, categorize, started)
    }

    /// Skip the image stages and parse text that was already recognized.
    pub fn recognize_text(&self, text: &str, categorize: bool) -> ReceiptDocument {
        let doc = Extractor::parse(text);
        if categorize {
            self.categorize_items(doc)
        } else {
            doc
        }
    }

    fn finish(&self, image: &GrayImage, categorize: bool, started: Instant) -> Result<ReceiptDocument, PipelineError> {
        debug!("Preprocessed in {:?}", started.elapsed());
        let text = self.recognizer.recognize(image)?;
        debug!("OCR produced {} chars", text.chars().count());
        let doc = self.recognize_text(&text, categorize);
        info!(
            items = doc.items.len(),
            has_total = doc.total.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Receipt recognized"
        );
        Ok(doc)
    }

    /// Label each item, passing the retailer as merchant hint. No-op when
    /// no engine is attached.
    fn categorize_items(&self, mut doc: ReceiptDocument) -> ReceiptDocument {
        let Some(engine) = &self.categorizer else {
            return doc;
        };
        let txs: Vec<CategorizableTransaction> = doc
            .items
            .iter()
            .map(|item| {
                let tx = CategorizableTransaction::new(item.name.clone(), item.line_sum);
                match &doc.retailer {
                    Some(retailer) => tx.with_merchant(retailer.clone()),
                    None => tx,
                }
            })
            .collect();
        let results = engine.categorize_batch(&txs);
        doc.items = doc
            .items
            .into_iter()
            .zip(results)
            .map(|(item, result)| item.categorized(Some(result.category)))
            .collect();
        doc
    }
}

impl<R: OcrBackend + 'static> ReceiptPipeline<R> {
    /// Run [`recognize_base64`](Self::recognize_base64) on the blocking pool.
    pub async fn recognize_blocking(
        self: Arc<Self>,
        payload: String,
        categorize: bool,
    ) -> Result<ReceiptDocument, PipelineError> {
        tokio::task::spawn_blocking(move || self.recognize_base64(&payload, categorize)).await?
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
