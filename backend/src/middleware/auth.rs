//! Optional identification of realtime handshakes.
//!
//! Presence tracking never rejects a connection over auth: a missing, malformed
//! or expired token simply leaves the session anonymous.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Cookie set by the dashboard's auth service.
pub const ACCESS_COOKIE_NAME: &str = "access_token";

/// The subset of access-token claims presence needs. Other claims are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeClaims {
    pub sub: String,
    pub exp: i64,
}

pub fn verify_handshake_token(
    token: &str,
    secret: &str,
) -> Result<HandshakeClaims, jsonwebtoken::errors::Error> {
    decode::<HandshakeClaims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

pub fn parse_bearer_token(header: &str) -> Option<&str> {
    if let Some(rest) = header.strip_prefix("Bearer ") {
        return Some(rest);
    }
    if let Some(rest) = header.strip_prefix("bearer ") {
        return Some(rest);
    }
    if let Some(space_idx) = header.find(' ') {
        let (scheme, rest) = header.split_at(space_idx);
        if scheme.eq_ignore_ascii_case("bearer") {
            return Some(rest.trim_start());
        }
    }
    None
}

/// Picks the handshake token: `Authorization` header, then `?token=`, then cookie.
pub fn handshake_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_token)
        .map(str::to_string)
        .or_else(|| {
            query_token
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
        })
        .or_else(|| {
            headers
                .get(header::COOKIE)
                .and_then(|value| value.to_str().ok())
                .and_then(|raw| cookie_value(raw, ACCESS_COOKIE_NAME))
        })
}

fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| key.trim() == name && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
}

/// Resolves the user behind a handshake, or `None` for anonymous connections.
pub fn optional_user_id(
    headers: &HeaderMap,
    query_token: Option<&str>,
    secret: &str,
) -> Option<String> {
    let token = handshake_token(headers, query_token)?;
    match verify_handshake_token(&token, secret) {
        Ok(claims) => Some(claims.sub),
        Err(err) => {
            tracing::debug!(error = %err, "Ignoring invalid handshake token");
            None
        }
    }
}
