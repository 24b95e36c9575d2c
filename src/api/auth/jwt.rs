//! Session JWTs (HS256)
//!
//! One claim set per authenticated session token. Both `exp` and `nbf` are
//! enforced on validation (see SPEC_FULL.md §6).

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const SESSION_TOKEN_TTL_SECS: i64 = 24 * 3600;

#[derive(Error, Debug)]
pub enum JwtError {
    #[error("token not yet valid or expired")]
    InvalidTime,

    #[error("malformed token or bad signature")]
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub auth_method: String,
}

pub fn create_session_token(
    signing_key: &[u8],
    user_id: &str,
    auth_method: &str,
) -> Result<String, JwtError> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: user_id.to_string(),
        iat: now,
        nbf: now,
        exp: now + SESSION_TOKEN_TTL_SECS,
        jti: Uuid::new_v4().to_string(),
        auth_method: auth_method.to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(signing_key),
    )
    .map_err(|_| JwtError::Invalid)
}

pub fn validate_session_token(token: &str, signing_key: &[u8]) -> Result<SessionClaims, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_nbf = true;

    decode::<SessionClaims>(token, &DecodingKey::from_secret(signing_key), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature
            | jsonwebtoken::errors::ErrorKind::ImmatureSignature => JwtError::InvalidTime,
            _ => JwtError::Invalid,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-signing-key-32-bytes-long!";

    #[test]
    fn test_roundtrip() {
        let token = create_session_token(KEY, "user-1", "api_key").unwrap();
        let claims = validate_session_token(&token, KEY).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.auth_method, "api_key");
    }

    #[test]
    fn test_rejects_wrong_key() {
        let token = create_session_token(KEY, "u1", "jwt").unwrap();
        assert!(validate_session_token(&token, b"a-completely-different-key-32by").is_err());
    }

    #[test]
    fn test_rejects_not_yet_valid_token() {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: "u1".to_string(),
            iat: now,
            nbf: now + 3600,
            exp: now + 7200,
            jti: "jti-1".to_string(),
            auth_method: "jwt".to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(KEY),
        )
        .unwrap();
        assert!(matches!(
            validate_session_token(&token, KEY),
            Err(JwtError::InvalidTime)
        ));
    }

    #[test]
    fn test_rejects_expired_token() {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: "u1".to_string(),
            iat: now - 7200,
            nbf: now - 7200,
            exp: now - 3600,
            jti: "jti-1".to_string(),
            auth_method: "jwt".to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(KEY),
        )
        .unwrap();
        assert!(matches!(
            validate_session_token(&token, KEY),
            Err(JwtError::InvalidTime)
        ));
    }
}
