use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use watira_engine::TurnError;
use watira_store::StoreError;

/// Failures returned to HTTP clients as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        if e.is_not_found() {
            Self::NotFound(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl From<TurnError> for ApiError {
    fn from(e: TurnError) -> Self {
        match e {
            TurnError::SessionNotFound(_) => Self::NotFound(e.to_string()),
            TurnError::Store(store) => store.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watira_core::SessionId;

    #[test]
    fn turn_errors_map_to_status() {
        let not_found: ApiError = TurnError::SessionNotFound(SessionId::from_raw("sess_x")).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let internal: ApiError = TurnError::Internal("boom".into()).into();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn message_is_plain() {
        assert_eq!(ApiError::BadRequest("empty message".into()).to_string(), "empty message");
    }
}
