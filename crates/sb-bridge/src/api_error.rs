//! HTTP API error types.
//!
//! Every error leaves the API as a JSON body. Spawn failures use the
//! `{"kind": "SpawnFailed", "detail": ...}` shape so a client can render a
//! readable message instead of an empty terminal; everything else uses
//! `{"error": ...}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sb_core::types::SpawnFailedBody;
use sb_session::SessionError;
use serde_json::json;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// The shell could not be resolved or launched.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The session exists but is in a state that forbids the request.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::SpawnFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::SpawnFailed { .. } => ApiError::SpawnFailed(message),
            SessionError::NotFound(_) => ApiError::NotFound(message),
            SessionError::AlreadyExists(_)
            | SessionError::ReadLoopActive(_)
            | SessionError::Closed(_) => ApiError::Conflict(message),
            SessionError::AtCapacity { .. } => ApiError::Unavailable(message),
            SessionError::WriteFailed(_) | SessionError::ResizeFailed(_) => {
                ApiError::InternalError(message)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::SpawnFailed(detail) => {
                tracing::warn!(%detail, "session spawn rejected");
                let body = SpawnFailedBody {
                    kind: "SpawnFailed".to_string(),
                    detail,
                };
                (status, Json(body)).into_response()
            }
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unavailable(msg)
            | ApiError::InternalError(msg) => {
                (status, Json(json!({ "error": msg }))).into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_failed_response() {
        let error = ApiError::from(SessionError::SpawnFailed {
            shell: "fish".to_string(),
            detail: "No such file or directory".to_string(),
        });
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = body_json(response).await;
        assert_eq!(body["kind"], "SpawnFailed");
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("fish"));
        assert!(detail.contains("No such file"));
    }

    #[tokio::test]
    async fn test_not_found_response() {
        let response = ApiError::from(SessionError::NotFound("abc".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("abc"));
    }

    #[tokio::test]
    async fn test_bad_request_response() {
        let response = ApiError::BadRequest("rows must be non-zero".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("rows"));
    }

    #[test]
    fn test_session_error_mapping() {
        assert_eq!(
            ApiError::from(SessionError::ReadLoopActive("s".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SessionError::AlreadyExists("s".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(SessionError::AtCapacity { max: 1 }).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(SessionError::WriteFailed("closed".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
