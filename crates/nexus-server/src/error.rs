use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use nexus_core::NexusError;
use serde_json::json;
use tracing::{debug, warn};

/// A broker error on its way out as an HTTP response. The status comes from
/// [`NexusError::status_hint`]; the body is `{"error", "status"}`.
#[derive(Debug)]
pub struct ApiError(pub NexusError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<NexusError> for ApiError {
    fn from(e: NexusError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_hint())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self.0, status = status.as_u16(), "request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        let body = json!({
            "error": self.0.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}
