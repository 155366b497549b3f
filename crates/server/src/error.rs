use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use finwise_ocr::{PipelineError, PreprocessError};
use serde_json::json;
use thiserror::Error;

/// Everything a handler can fail with. Serialized as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    /// - Undecodable payload: 400 Bad Request
    /// - OCR engine failure: 502 Bad Gateway
    /// - Worker task panicked or was cancelled: 500
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Pipeline(PipelineError::Preprocess(PreprocessError::Encode(_))) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Pipeline(PipelineError::Preprocess(_)) => StatusCode::BAD_REQUEST,
            Self::Pipeline(PipelineError::Ocr(_)) => StatusCode::BAD_GATEWAY,
            Self::Pipeline(PipelineError::Join(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        } else {
            tracing::warn!("Rejected request: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finwise_ocr::OcrError;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(PipelineError::Ocr(OcrError::NotAvailable)).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(PipelineError::Preprocess(PreprocessError::Encode("png".into()))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn message_is_passed_through() {
        let err = ApiError::from(PipelineError::Ocr(OcrError::Engine("timeout".into())));
        assert_eq!(err.to_string(), "OCR recognition failed: OCR engine error: timeout");
    }
}
