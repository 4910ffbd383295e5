//! Session-token authentication for HTTP and WebSocket requests.

use agora_shared::types::Identity;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::api::AppState;
use crate::error::ServerError;

/// The authenticated caller. Resolved from `Authorization: Bearer <token>`,
/// or from a `token` query parameter for browsers opening a WebSocket.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Identity);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| query_token(parts.uri.query()))
            .ok_or(ServerError::Unauthorized)?;
        state.broker.authenticate(&token).map(AuthUser)
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_token() {
        assert_eq!(query_token(Some("token=abc")), Some("abc".to_string()));
        assert_eq!(query_token(Some("room=1&token=xyz")), Some("xyz".to_string()));
        assert_eq!(query_token(Some("token=")), None);
        assert_eq!(query_token(Some("tokens=abc")), None);
        assert_eq!(query_token(None), None);
    }

    #[test]
    fn test_bearer_token() {
        let (mut parts, _) = axum::http::Request::builder()
            .header(AUTHORIZATION, "Bearer s3cret")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_token(&parts), Some("s3cret".to_string()));

        parts.headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&parts), None);
    }
}
