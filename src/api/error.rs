//! Maps the crate-wide `Error` onto HTTP status codes (spec.md §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::FunctionNotFound | Error::ExecutionNotFound => StatusCode::NOT_FOUND,
            Error::FunctionAlreadyExists => StatusCode::CONFLICT,
            Error::CapacityExhausted(_) | Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::DispatchFailed(_) => StatusCode::BAD_GATEWAY,
            Error::VmCreateFailed(_) | Error::Db(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
