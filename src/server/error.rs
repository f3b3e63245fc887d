use crate::error::MockError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub MockError);

impl AppError {
    /// 400 Bad Request with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(MockError::validation(msg))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            MockError::Validation(_) => StatusCode::BAD_REQUEST,
            MockError::NotFound { .. } | MockError::Unmatched => StatusCode::NOT_FOUND,
            err @ MockError::Persistence(_) if err.is_conflict() => StatusCode::CONFLICT,
            MockError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<MockError> for AppError {
    fn from(err: MockError) -> Self {
        Self(err)
    }
}
