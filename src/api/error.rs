use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::services::event::EventError;
use crate::services::registry::RegistryError;

/// HTTP 错误响应体
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// 统一的 API 错误
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{resource} not found: {id}"),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { service_id } => ApiError::not_found("Service", &service_id),
            RegistryError::Validation(message) => ApiError::bad_request(message),
            RegistryError::Cache(e) => {
                tracing::error!(error = %e, "Registry store failure");
                ApiError::internal(e.to_string())
            }
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::NotFound { event_id } => ApiError::not_found("Event", &event_id),
            e @ (EventError::InvalidEventType { .. }
            | EventError::InvalidPriority { .. }
            | EventError::Invalid(_)) => ApiError::bad_request(e.to_string()),
            EventError::Cache(e) => {
                tracing::error!(error = %e, "Event history failure");
                ApiError::internal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_errors_map_to_status() {
        let err: ApiError = RegistryError::NotFound {
            service_id: "svc-1".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: ApiError = RegistryError::Validation("port".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = EventError::InvalidPriority {
            priority: "urgent".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
