//! Error-to-HTTP mapping for the API handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use kvserve_core::scheduler::PublishError;
use kvserve_core::sequence::SequenceError;

use crate::crypto::CryptoError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<SequenceError> for ApiError {
    fn from(err: SequenceError) -> Self {
        match err {
            SequenceError::EmptyPrompt | SequenceError::InvalidImageIndex(_) => {
                ApiError::BadRequest(err.to_string())
            }
            _ => ApiError::Internal(format!("failed to create new sequence: {err}")),
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        ApiError::Internal(format!("failed to load cache: {err}"))
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Rsa(_) | CryptoError::Pem(_) => {
                ApiError::Internal(err.to_string())
            }
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let resp = ApiError::BadRequest("nope".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_prompt_is_a_bad_request() {
        let err: ApiError = SequenceError::EmptyPrompt.into();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
