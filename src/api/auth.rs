use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;

use super::{ApiError, AppState};

pub const API_KEY_HEADER: &str = "x-api-key";

/// 写操作需要携带有效的 `x-api-key`，读操作放行
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !state.config.validate_token(provided) {
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "Rejected request with missing or invalid API key"
        );
        return Err(ApiError::unauthorized("Missing or invalid API key"));
    }

    Ok(next.run(request).await)
}
