//! Bearer-token authentication (SPEC_FULL.md §4.5, ambient addition): a
//! no-op when `API_TOKEN` is unset, so local/dev deployments need no setup.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::Error;

use super::error::ApiError;
use super::state::AppState;

pub async fn require_bearer_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.api_token else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected.as_ref() => Ok(next.run(request).await),
        _ => Err(ApiError(Error::Unauthorized)),
    }
}
