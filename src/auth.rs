//! Token validation for the upgrade handshake.
//!
//! The authentication collaborator issues HS256 tokens with `sub`, `email`,
//! `nickname`, and `exp` claims; this module only verifies them. Because some
//! WebSocket clients cannot set headers on the upgrade request, the token is
//! accepted either as `Authorization: Bearer <token>` or as a `token` query
//! parameter.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by collaborator-issued tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user ID
    pub sub: String,
    pub email: String,
    pub nickname: String,
    /// Expiry, seconds since the Unix epoch
    pub exp: i64,
}

/// Authentication errors.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No token in the Authorization header or the query string
    MissingToken,
    /// Token failed signature or expiry validation
    InvalidToken(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingToken => write!(f, "Authorization token required"),
            Self::InvalidToken(e) => write!(f, "Invalid or expired token: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Pick the token out of the request: bearer header first, query fallback.
pub fn extract_token(
    authorization: Option<&str>,
    query_token: Option<&str>,
) -> Result<String, AuthError> {
    if let Some(header) = authorization {
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }
    match query_token {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AuthError::MissingToken),
    }
}

/// Verify a token against the shared secret and return its claims.
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    decode::<Claims>(token, &key, &Validation::default())
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// Mint a token the way the authentication collaborator does. Used by
/// integration tests and local tooling.
pub fn issue_token(
    user_id: &str,
    email: &str,
    nickname: &str,
    ttl: std::time::Duration,
    secret: &str,
) -> Result<String, AuthError> {
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        nickname: nickname.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
    };
    let key = EncodingKey::from_secret(secret.as_bytes());
    encode(&Header::default(), &claims, &key).map_err(|e| AuthError::InvalidToken(e.to_string()))
}
