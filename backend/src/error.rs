use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use shared::ErrorResponse;

use crate::inference::ModelError;

/// Failure of one of the pipeline stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid image data: {0}")]
    InvalidImageData(String),
    #[error("Inference failed: {message}: {source}")]
    InferenceFailure {
        message: String,
        #[source]
        source: ModelError,
    },
    #[error("Segmentation failed: {message}: {source}")]
    SegmentationFailure {
        message: String,
        #[source]
        source: ModelError,
    },
}

impl PipelineError {
    pub fn invalid_image<S: Into<String>>(msg: S) -> Self {
        Self::InvalidImageData(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S, source: ModelError) -> Self {
        Self::InferenceFailure {
            message: msg.into(),
            source,
        }
    }

    pub fn segmentation<S: Into<String>>(msg: S, source: ModelError) -> Self {
        Self::SegmentationFailure {
            message: msg.into(),
            source,
        }
    }
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("No image provided")]
    MissingImage,
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
    #[error("Upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<actix_multipart::MultipartError> for ApiError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        ApiError::InvalidBody(err.to_string())
    }
}

impl From<actix_web::error::PayloadError> for ApiError {
    fn from(err: actix_web::error::PayloadError) -> Self {
        ApiError::InvalidBody(err.to_string())
    }
}

impl From<actix_web::error::BlockingError> for ApiError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(PipelineError::InvalidImageData(_)) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::InferenceFailure { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::SegmentationFailure { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::MissingImage | ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}
