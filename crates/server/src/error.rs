use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Request failures; each maps to a status code and the uniform JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Rejected upload or query (422).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Preprocessing, OCR or timeout (500).
    #[error("Failed to process KTP image: {0}")]
    Processing(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "Validation failed.",
            ApiError::Processing(_) => "Failed to process KTP image.",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let title = self.title();
        let message = match self {
            ApiError::Validation(m) | ApiError::Processing(m) => m,
        };
        (status, Json(ErrorBody { error: title, message })).into_response()
    }
}

impl From<ktp_ocr::PipelineError> for ApiError {
    fn from(e: ktp_ocr::PipelineError) -> Self {
        ApiError::Processing(e.to_string())
    }
}
