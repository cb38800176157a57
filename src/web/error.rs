// Error types for the API server

use crate::inference::InferenceError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

/// API server error types
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request, bad headers, missing or invalid file.
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    MethodNotAllowed(String),
    /// Daily quota or per-IP limit reached.
    TooManyRequests(String),
    /// The inference service or another remote dependency failed.
    Upstream(String),
    /// Required credentials are missing from the deployment.
    Configuration(String),
}

/// Body of every error response.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub status: u16,
    pub timestamp: String,
    pub request_id: String,
}

pub const GENERIC_SERVER_ERROR: &str = "Internal server error";

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) | Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::MethodNotAllowed(msg)
            | Self::TooManyRequests(msg)
            | Self::Upstream(msg)
            | Self::Configuration(msg) => msg,
        }
    }
}

pub fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = new_request_id();

        // Server-side failures are reported generically; the detail stays in the log.
        let error = if status.is_server_error() {
            tracing::error!(
                target: "security",
                event = "error_response",
                status = status.as_u16(),
                request_id = %request_id,
                "{:?}",
                self
            );
            GENERIC_SERVER_ERROR.to_string()
        } else {
            tracing::debug!(
                status = status.as_u16(),
                request_id = %request_id,
                "Rejected request: {}",
                self.message()
            );
            self.message().to_string()
        };

        let body = Json(ErrorBody {
            error,
            status: status.as_u16(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id,
        });

        (status, body).into_response()
    }
}

impl From<InferenceError> for ApiError {
    fn from(error: InferenceError) -> Self {
        Self::Upstream(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_client_error_shape() {
        let (status, body) =
            body_json(ApiError::TooManyRequests("Daily free limit reached".into())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Daily free limit reached");
        assert_eq!(body["status"], 429);
        assert!(body["requestId"].as_str().unwrap().starts_with("req_"));
        let timestamp = body["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_server_error_hides_detail() {
        let (status, body) =
            body_json(ApiError::Upstream("token r8_secret rejected".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], GENERIC_SERVER_ERROR);
        assert_eq!(body["status"], 500);
    }
}
