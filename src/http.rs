//! Shared HTTP helpers for the public and control surfaces.

use axum::http::HeaderMap;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::warn;

use crate::config::CLIENT_TOKEN_HEADER;
use crate::error::ApiError;
use crate::store::Store;

/// Validates the `X-Client-Token` header against the portal's issued tokens.
pub async fn require_client_token(
    store: &Store,
    portal_id: &str,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let token = headers
        .get(CLIENT_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    store
        .require_client_token(portal_id, token)
        .await
        .map_err(ApiError::from)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyObject {}

/// Accepts an empty body or a bare `{}` object, nothing else.
pub fn ensure_empty_json_body(body: &[u8]) -> Result<(), ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    serde_json::from_slice::<EmptyObject>(body)
        .map(|_| ())
        .map_err(|_| ApiError::BadRequest("invalid json".into()))
}

/// Decodes a JSON request body, rejecting unknown fields at the type level.
pub fn parse_json_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest("invalid json".into()))
}

/// The control surface has no authentication of its own; a non-loopback bind
/// must be shielded by the proxy.
pub fn warn_if_public_bind(addr: &SocketAddr) {
    if !addr.ip().is_loopback() {
        warn!(
            %addr,
            "binding on a non-loopback address; ensure /api/control/* is blocked at the proxy"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_variants() {
        assert!(ensure_empty_json_body(b"").is_ok());
        assert!(ensure_empty_json_body(b"  \n").is_ok());
        assert!(ensure_empty_json_body(b"{}").is_ok());
        assert!(ensure_empty_json_body(b"{\"a\":1}").is_err());
        assert!(ensure_empty_json_body(b"null").is_err());
        assert!(ensure_empty_json_body(b"not json").is_err());
    }
}
