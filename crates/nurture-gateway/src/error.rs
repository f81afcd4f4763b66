//! Mapping engine errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nurture_core::{AdmissionDenial, NurtureError};

/// A [`NurtureError`] rendered as `{"ok": false, "error": ...}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub NurtureError);

pub type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

impl From<NurtureError> for ApiError {
    fn from(err: NurtureError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            NurtureError::Validation(_) => StatusCode::BAD_REQUEST,
            NurtureError::NotFound(_) => StatusCode::NOT_FOUND,
            NurtureError::AlreadyExists { .. } | NurtureError::ConsistencyViolation(_) => StatusCode::CONFLICT,
            NurtureError::AdmissionDenied(AdmissionDenial::Unsubscribed) => StatusCode::CONFLICT,
            NurtureError::AdmissionDenied(_) => StatusCode::TOO_MANY_REQUESTS,
            NurtureError::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("❌ {}", self.0);
        }
        let mut body = serde_json::json!({ "ok": false, "error": self.0.to_string() });
        if let NurtureError::AdmissionDenied(reason) = &self.0 {
            body["reason"] = serde_json::Value::String(reason.as_str().to_string());
        }
        (status, Json(body)).into_response()
    }
}
