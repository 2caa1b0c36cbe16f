//! Token encoding and decoding.
//!
//! Access and refresh tokens are HS256 JWTs whose `kid` header names the
//! signing key version. Decoding never consults the system clock: callers pass
//! the current time, which keeps every function here pure.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::session::JwtPayload;

/// Token type for distinguishing access vs refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived, validated locally against handshake key material
    Access,
    /// Long-lived, single-use, consumed by the backend on rotation
    Refresh,
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user id)
    pub sub: String,
    /// Session handle
    pub sid: String,
    /// Application payload
    #[serde(default)]
    pub payload: JwtPayload,
    /// Anti-CSRF token bound to this access token, when enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_csrf: Option<String>,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Claims carried by a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// JWT ID, consumed exactly once by the backend
    pub jti: String,
    /// Session handle
    pub sid: String,
    /// Subject (user id)
    pub sub: String,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    pub iat: u64,
    pub exp: u64,
}

/// Errors that can occur while encoding or decoding tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Structurally corrupt, bad signature, or wrong token type
    Malformed,
    /// Embedded expiry has passed
    Expired,
    /// Serializer failure
    Encoding(String),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Malformed => write!(f, "Malformed token"),
            TokenError::Expired => write!(f, "Expired token"),
            TokenError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<TokenError> for crate::error::SessionError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Malformed => Self::MalformedToken,
            TokenError::Expired => Self::ExpiredToken,
            TokenError::Encoding(msg) => Self::BackendRejected(msg),
        }
    }
}

/// Signs and verifies tokens with one versioned key.
#[derive(Clone)]
pub struct TokenCodec {
    key_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(key_id: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            key_id: key_id.into(),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.key_id.clone());
        header
    }

    pub fn encode_access(&self, claims: &AccessClaims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&self.header(), claims, &self.encoding_key)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    pub fn encode_refresh(&self, claims: &RefreshClaims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&self.header(), claims, &self.encoding_key)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Decode an access token, checking signature, type and expiry against `now`.
    pub fn decode_access(&self, token: &str, now: u64) -> Result<AccessClaims, TokenError> {
        let claims: AccessClaims = jsonwebtoken::decode(token, &self.decoding_key, &validation())
            .map_err(|_| TokenError::Malformed)?
            .claims;

        if claims.token_type != TokenType::Access {
            return Err(TokenError::Malformed);
        }
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Decode a refresh token, checking signature, type and expiry against `now`.
    pub fn decode_refresh(&self, token: &str, now: u64) -> Result<RefreshClaims, TokenError> {
        let claims: RefreshClaims = jsonwebtoken::decode(token, &self.decoding_key, &validation())
            .map_err(|_| TokenError::Malformed)?
            .claims;

        if claims.token_type != TokenType::Refresh {
            return Err(TokenError::Malformed);
        }
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

/// Expiry is checked by hand against the caller's clock.
fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

/// Read the `kid` header without verifying anything.
pub fn token_key_id(token: &str) -> Option<String> {
    jsonwebtoken::decode_header(token).ok()?.kid
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn generate_anti_csrf_token() -> String {
    random_token()
}

pub fn generate_id_refresh_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Compare anti-CSRF tokens without short-circuiting on the first differing byte.
pub fn anti_csrf_matches(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_claims(exp: u64) -> AccessClaims {
        AccessClaims {
            sub: "user-1".to_string(),
            sid: "handle-1".to_string(),
            payload: JwtPayload::new().with("role", "admin"),
            anti_csrf: None,
            token_type: TokenType::Access,
            iat: exp.saturating_sub(60),
            exp,
        }
    }

    fn refresh_claims(exp: u64) -> RefreshClaims {
        RefreshClaims {
            jti: "jti-1".to_string(),
            sid: "handle-1".to_string(),
            sub: "user-1".to_string(),
            token_type: TokenType::Refresh,
            iat: exp.saturating_sub(60),
            exp,
        }
    }

    #[test]
    fn test_encode_and_decode_access_token() {
        let codec = TokenCodec::new("k1", b"test-secret-key-for-testing");
        let now = unix_now();
        let claims = access_claims(now + 300);

        let token = codec.encode_access(&claims).unwrap();
        let decoded = codec.decode_access(&token, now).unwrap();
        assert_eq!(decoded, claims);
        assert_eq!(token_key_id(&token).as_deref(), Some("k1"));
    }

    #[test]
    fn test_expiry_uses_supplied_time() {
        let codec = TokenCodec::new("k1", b"test-secret-key-for-testing");
        let token = codec.encode_access(&access_claims(1_000)).unwrap();

        assert!(codec.decode_access(&token, 999).is_ok());
        assert_eq!(codec.decode_access(&token, 1_000), Err(TokenError::Expired));
        assert_eq!(codec.decode_access(&token, 5_000), Err(TokenError::Expired));
    }

    #[test]
    fn test_wrong_token_type_rejected() {
        let codec = TokenCodec::new("k1", b"test-secret-key-for-testing");
        let now = unix_now();
        let access = codec.encode_access(&access_claims(now + 300)).unwrap();
        let refresh = codec.encode_refresh(&refresh_claims(now + 300)).unwrap();

        assert_eq!(codec.decode_refresh(&access, now), Err(TokenError::Malformed));
        assert_eq!(codec.decode_access(&refresh, now), Err(TokenError::Malformed));
        assert!(codec.decode_refresh(&refresh, now).is_ok());
    }

    #[test]
    fn test_corrupted_token() {
        let codec = TokenCodec::new("k1", b"test-secret-key-for-testing");
        assert_eq!(
            codec.decode_access("invalid-token", unix_now()),
            Err(TokenError::Malformed)
        );
        assert_eq!(token_key_id("invalid-token"), None);
    }

    #[test]
    fn test_wrong_secret() {
        let codec1 = TokenCodec::new("k1", b"secret-1");
        let codec2 = TokenCodec::new("k1", b"secret-2");
        let now = unix_now();

        let token = codec1.encode_access(&access_claims(now + 300)).unwrap();
        assert_eq!(codec2.decode_access(&token, now), Err(TokenError::Malformed));
    }

    #[test]
    fn test_anti_csrf_tokens() {
        let a = generate_anti_csrf_token();
        let b = generate_anti_csrf_token();
        assert_ne!(a, b);
        assert!(anti_csrf_matches(&a, &a.clone()));
        assert!(!anti_csrf_matches(&a, &b));
        assert!(!anti_csrf_matches(&a, ""));
    }
}
