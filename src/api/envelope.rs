//! Consistent response envelope for the REST surface.
//!
//! Every response is wrapped in either [`ApiResponse`] (success) or
//! [`ApiErrorResponse`] (error), ensuring a uniform JSON shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;

use crate::error::DispatchError;

/// Metadata included in every response.
#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub timestamp: String,
    pub version: &'static str,
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            version: "1",
        }
    }
}

/// Successful response: `{ "data": T, "meta": { ... } }`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Response {
        let body = Self { data, meta: ResponseMeta::default() };
        (StatusCode::OK, axum::Json(body)).into_response()
    }

    pub fn created(data: T) -> Response {
        let body = Self { data, meta: ResponseMeta::default() };
        (StatusCode::CREATED, axum::Json(body)).into_response()
    }
}

/// Error detail inside [`ApiErrorResponse`].
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Error response: `{ "error": { "code", "message" }, "meta": { ... } }`
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub error: ErrorDetail,
    pub meta: ResponseMeta,
}

impl ApiErrorResponse {
    pub fn build(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
        let body = Self {
            error: ErrorDetail { code: code.to_owned(), message: message.into() },
            meta: ResponseMeta::default(),
        };
        (status, axum::Json(body)).into_response()
    }

    pub fn not_found(message: impl Into<String>) -> Response {
        Self::build(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Response {
        Self::build(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Response {
        Self::build(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

/// Map a dispatch error onto the REST status space.
pub fn error_response(err: &DispatchError) -> Response {
    let status = match err {
        DispatchError::InvalidCoordinates(_)
        | DispatchError::InvalidAmount(_)
        | DispatchError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
        DispatchError::RideNotAvailable | DispatchError::NotNotified => StatusCode::CONFLICT,
        DispatchError::NotEligible(_) | DispatchError::InsufficientFunds { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::TransportFailure
        | DispatchError::Store(_)
        | DispatchError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ApiErrorResponse::build(status, err.code(), err.to_string())
}
