//! Unified API error type and conversions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;

use crate::pathsafe::PathError;
use crate::store::StoreError;

pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Gone(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Gone(msg) => (StatusCode::GONE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, JsonResponse(ErrorBody { error: message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::PortalNotFound => ApiError::NotFound("portal not found".into()),
            StoreError::PortalAlreadyClaimed => ApiError::Conflict("portal already claimed".into()),
            StoreError::PortalClosed => ApiError::Gone("portal closed".into()),
            StoreError::ClientTokenRequired => {
                ApiError::Unauthorized("client token required".into())
            }
            StoreError::ClientTokenInvalid => ApiError::Forbidden("client token invalid".into()),
            StoreError::UploadNotFound => ApiError::NotFound("upload not found".into()),
            StoreError::UploadAlreadyCommitted => {
                ApiError::Conflict("upload already committed".into())
            }
            StoreError::UploadAlreadyExists => ApiError::Conflict("upload already exists".into()),
            StoreError::IdGeneration => ApiError::Internal("failed to generate id".into()),
        }
    }
}

impl From<PathError> for ApiError {
    fn from(error: PathError) -> Self {
        match error {
            PathError::RelpathEmpty => ApiError::BadRequest("relpath required".into()),
            PathError::RelpathInvalid | PathError::RelpathEscapes => {
                ApiError::BadRequest("invalid relpath".into())
            }
            PathError::DestAbsInvalid => ApiError::BadRequest("dest_abs must be absolute".into()),
        }
    }
}
