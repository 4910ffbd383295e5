use agora_shared::protocol::ServerEvent;
use agora_store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures surfaced to a client, over HTTP or as a socket `error` event.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed, missing or oversized input. The reason is shown verbatim.
    #[error("{0}")]
    Validation(String),

    /// Insufficient level. Never says which level would have sufficed.
    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid or expired captcha")]
    Challenge,

    /// Storage failure. The cause is logged where it happens and never
    /// shown to the client.
    #[error("server failed to save")]
    Persistence,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("authentication required")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn validation(reason: impl Into<String>) -> Self {
        ServerError::Validation(reason.into())
    }

    /// Name the missing entity in a generic not-found error.
    pub fn named(self, what: &'static str) -> Self {
        match self {
            ServerError::NotFound(_) => ServerError::NotFound(what),
            other => other,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::PermissionDenied | ServerError::Challenge => StatusCode::FORBIDDEN,
            ServerError::Persistence | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    /// Client-facing message.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// The sender-only socket event for this error.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.public_message())
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("record"),
            StoreError::InvalidPermission(inner) => ServerError::Validation(inner.to_string()),
            refused @ (StoreError::ProtectedUser(_) | StoreError::AdminOverlay(_)) => {
                ServerError::Validation(refused.to_string())
            }
            other => {
                tracing::error!(error = %other, "storage failure");
                ServerError::Persistence
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "message": self.public_message(),
        });

        (self.status(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServerError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::PermissionDenied.status(), StatusCode::FORBIDDEN);
        assert_eq!(ServerError::Challenge.status(), StatusCode::FORBIDDEN);
        assert_eq!(ServerError::Persistence.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ServerError::NotFound("room").status(), StatusCode::NOT_FOUND);
        assert_eq!(ServerError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = ServerError::Internal("mutex poisoned".into());
        assert_eq!(err.public_message(), "internal server error");
        assert_eq!(err.to_event(), ServerEvent::error("internal server error"));
    }

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(
            ServerError::from(StoreError::NotFound),
            ServerError::NotFound(_)
        ));
        assert!(matches!(
            ServerError::from(StoreError::Migration("boom".into())),
            ServerError::Persistence
        ));
        assert!(matches!(
            ServerError::from(StoreError::ProtectedUser(1)),
            ServerError::Validation(_)
        ));
    }
}
