//! Operator authentication
//!
//! Admin routes require a shared bearer token, compared in constant time.
//! The `x-operator-email` header identifies who acted and flows into the
//! audit trail.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use tessera_collections::Actor;

use crate::config::Config;
use crate::error::ApiError;

/// Verify the bearer token and resolve the acting operator.
pub fn require_operator(config: &Config, headers: &HeaderMap) -> Result<Actor, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let expected = config.operator_token.as_bytes();
    if expected.is_empty() || token.as_bytes().ct_eq(expected).unwrap_u8() != 1 {
        return Err(ApiError::Unauthorized);
    }

    let email = headers
        .get("x-operator-email")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown-operator");

    Ok(Actor::operator(email))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(token: &str) -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".into(),
            operator_token: token.into(),
        }
    }

    fn headers(auth: Option<&str>, email: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            headers.insert(
                axum::http::header::AUTHORIZATION,
                auth.parse().expect("header value"),
            );
        }
        if let Some(email) = email {
            headers.insert("x-operator-email", email.parse().expect("header value"));
        }
        headers
    }

    #[test]
    fn test_valid_token_resolves_operator() {
        let config = test_config("secret-token");
        let headers = headers(Some("Bearer secret-token"), Some("ops@tessera.live"));
        let actor = require_operator(&config, &headers).expect("should authenticate");
        assert_eq!(actor.actor_id.as_deref(), Some("ops@tessera.live"));
    }

    #[test]
    fn test_missing_email_falls_back_to_placeholder() {
        let config = test_config("secret-token");
        let headers = headers(Some("Bearer secret-token"), None);
        let actor = require_operator(&config, &headers).expect("should authenticate");
        assert_eq!(actor.actor_id.as_deref(), Some("unknown-operator"));
    }

    #[test]
    fn test_wrong_token_rejected() {
        let config = test_config("secret-token");
        assert!(require_operator(&config, &headers(Some("Bearer wrong"), None)).is_err());
    }

    #[test]
    fn test_missing_header_rejected() {
        let config = test_config("secret-token");
        assert!(require_operator(&config, &headers(None, None)).is_err());
    }

    #[test]
    fn test_non_bearer_scheme_rejected() {
        let config = test_config("secret-token");
        assert!(require_operator(&config, &headers(Some("Basic secret-token"), None)).is_err());
    }

    #[test]
    fn test_empty_configured_token_rejects_everything() {
        let config = test_config("");
        assert!(require_operator(&config, &headers(Some("Bearer "), None)).is_err());
    }
}
