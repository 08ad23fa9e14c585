use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use keysprint_core::room::UserId;
use keysprint_core::time::timestamp_ms;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration shared with handlers.
#[derive(Clone)]
pub struct AuthConfig {
    /// Shared secret for session token verification. None = every
    /// authenticate attempt is rejected.
    pub session_secret: Option<String>,
    /// Bearer token for management API access. None = auth disabled.
    pub bearer_token: Option<String>,
}

/// Identity extracted from a verified session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

/// Claims carried in a session token payload. Issued by the identity
/// provider; this server only verifies.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenClaims {
    user_id: UserId,
    username: String,
    /// Expiry as Unix millis. Absent = non-expiring.
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    Malformed,
    BadSignature,
    Expired,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed token"),
            Self::BadSignature => write!(f, "bad token signature"),
            Self::Expired => write!(f, "token expired"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Verify a session token of the form
/// `hex(claims-json) + "." + hex(hmac-sha256(secret, claims-json))` and
/// extract the identity it names.
pub fn verify_session_token(token: &str, secret: &str) -> Result<Identity, AuthError> {
    let Some((payload_hex, sig_hex)) = token.split_once('.') else {
        return Err(AuthError::Malformed);
    };

    let payload = hex::decode(payload_hex).map_err(|_| AuthError::Malformed)?;
    let signature = hex::decode(sig_hex).map_err(|_| AuthError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Malformed)?;
    mac.update(&payload);
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::BadSignature)?;

    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
    if claims.user_id.is_empty() {
        return Err(AuthError::Malformed);
    }
    if let Some(exp) = claims.exp
        && exp < timestamp_ms()
    {
        return Err(AuthError::Expired);
    }

    Ok(Identity {
        user_id: claims.user_id,
        username: claims.username,
    })
}

/// Axum middleware that validates Bearer token authentication.
/// If no token is configured (`AuthConfig::bearer_token` is None), all
/// requests are allowed through (auth disabled).
pub async fn bearer_auth_middleware(
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_config = request
        .extensions()
        .get::<AuthConfig>()
        .cloned()
        .unwrap_or(AuthConfig {
            session_secret: None,
            bearer_token: None,
        });

    if let Some(ref expected) = auth_config.bearer_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match provided {
            Some(token) if token == expected => {},
            _ => return Err(StatusCode::UNAUTHORIZED),
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign_token(secret: &str, claims_json: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(claims_json.as_bytes());
        let sig = mac.finalize().into_bytes();
        format!("{}.{}", hex::encode(claims_json), hex::encode(sig))
    }

    #[test]
    fn verify_valid_token() {
        let token = sign_token("test-secret", r#"{"userId":"u1","username":"Alice"}"#);
        let identity = verify_session_token(&token, "test-secret").unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.username, "Alice");
    }

    #[test]
    fn verify_wrong_secret_fails() {
        let token = sign_token("test-secret", r#"{"userId":"u1","username":"Alice"}"#);
        assert_eq!(
            verify_session_token(&token, "other-secret"),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn verify_tampered_payload_fails() {
        let token = sign_token("test-secret", r#"{"userId":"u1","username":"Alice"}"#);
        let forged_payload = hex::encode(r#"{"userId":"u2","username":"Mallory"}"#);
        let sig = token.split_once('.').unwrap().1;
        assert_eq!(
            verify_session_token(&format!("{forged_payload}.{sig}"), "test-secret"),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn verify_expired_token_fails() {
        let token = sign_token(
            "test-secret",
            r#"{"userId":"u1","username":"Alice","exp":1000}"#,
        );
        assert_eq!(
            verify_session_token(&token, "test-secret"),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn verify_future_expiry_ok() {
        let exp = timestamp_ms() + 60_000;
        let token = sign_token(
            "test-secret",
            &format!(r#"{{"userId":"u1","username":"Alice","exp":{exp}}}"#),
        );
        assert!(verify_session_token(&token, "test-secret").is_ok());
    }

    #[test]
    fn verify_malformed_tokens_fail() {
        assert_eq!(
            verify_session_token("no-dot-here", "s"),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            verify_session_token("nothex!.cafe", "s"),
            Err(AuthError::Malformed)
        );
        // Valid signature over non-JSON payload.
        let token = sign_token("s", "not json");
        assert_eq!(verify_session_token(&token, "s"), Err(AuthError::Malformed));
    }

    #[test]
    fn verify_empty_user_id_fails() {
        let token = sign_token("s", r#"{"userId":"","username":"Ghost"}"#);
        assert_eq!(verify_session_token(&token, "s"), Err(AuthError::Malformed));
    }
}
