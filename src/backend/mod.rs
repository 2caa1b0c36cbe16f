//! Backend session service contract.
//!
//! The session store never mints or persists anything itself: it delegates to
//! a [`SessionBackend`]. Every call is assumed to be able to fail with
//! [`SessionError::BackendUnavailable`] independently of its business outcome.
//!
//! Two local implementations are provided: [`MemoryBackend`] (in-process,
//! used by tests) and the SQLite-backed [`crate::db::Database`].

mod memory;

pub use memory::MemoryBackend;

use futures::future::BoxFuture;
use std::time::Duration;

use crate::codec::{
    AccessClaims, RefreshClaims, TokenCodec, TokenType, generate_anti_csrf_token,
    generate_id_refresh_token,
};
use crate::error::SessionError;
use crate::handshake::{
    DEFAULT_ACCESS_TOKEN_VALIDITY, DEFAULT_REFRESH_TOKEN_VALIDITY, HandshakeInfo, SameSite,
};
use crate::session::{IssuedSession, JwtPayload, PayloadUpdate, Session, TokenPair};

/// Request/response operations the session store relies on.
pub trait SessionBackend: Send + Sync + 'static {
    fn fetch_handshake_info(&self) -> BoxFuture<'_, Result<HandshakeInfo, SessionError>>;

    fn create_session<'a>(
        &'a self,
        user_id: &'a str,
        payload: &'a JwtPayload,
    ) -> BoxFuture<'a, Result<IssuedSession, SessionError>>;

    /// Current state of a live session. `SessionNotFound` once revoked or expired.
    fn validate_session<'a>(
        &'a self,
        session_handle: &'a str,
    ) -> BoxFuture<'a, Result<Session, SessionError>>;

    /// Rotate a refresh token. A token presented after its rotation must yield
    /// `TokenTheftDetected` and revoke the session.
    fn refresh_session<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<IssuedSession, SessionError>>;

    /// Returns whether a session was actually removed.
    fn revoke_session<'a>(
        &'a self,
        session_handle: &'a str,
    ) -> BoxFuture<'a, Result<bool, SessionError>>;

    fn revoke_all_sessions_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<usize, SessionError>>;

    fn update_payload<'a>(
        &'a self,
        session_handle: &'a str,
        payload: &'a JwtPayload,
    ) -> BoxFuture<'a, Result<PayloadUpdate, SessionError>>;
}

/// Tokens minted for one session, plus the bookkeeping a backend persists.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub pair: TokenPair,
    pub refresh_jti: String,
    /// Refresh token expiry, which is also the session expiry (Unix seconds)
    pub expires_at: u64,
}

/// Signing material and token policy shared by the local backends.
#[derive(Clone)]
pub struct BackendSettings {
    key_id: String,
    signing_secret: Vec<u8>,
    codec: TokenCodec,
    pub access_token_validity: Duration,
    pub refresh_token_validity: Duration,
    pub cookie_domain: Option<String>,
    pub cookie_same_site: SameSite,
    pub refresh_token_path: String,
    pub anti_csrf: bool,
    pub access_token_blacklisting: bool,
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("key_id", &self.key_id)
            .field("access_token_validity", &self.access_token_validity)
            .field("refresh_token_validity", &self.refresh_token_validity)
            .field("anti_csrf", &self.anti_csrf)
            .field("access_token_blacklisting", &self.access_token_blacklisting)
            .finish_non_exhaustive()
    }
}

impl BackendSettings {
    pub const DEFAULT_KEY_ID: &'static str = "k1";

    pub fn new(signing_secret: Vec<u8>) -> Self {
        Self {
            codec: TokenCodec::new(Self::DEFAULT_KEY_ID, &signing_secret),
            key_id: Self::DEFAULT_KEY_ID.to_string(),
            signing_secret,
            access_token_validity: DEFAULT_ACCESS_TOKEN_VALIDITY,
            refresh_token_validity: DEFAULT_REFRESH_TOKEN_VALIDITY,
            cookie_domain: None,
            cookie_same_site: SameSite::default(),
            refresh_token_path: "/".to_string(),
            anti_csrf: false,
            access_token_blacklisting: true,
        }
    }

    /// Replace the signing key. Tokens signed with the previous key stop validating.
    pub fn with_signing_key(mut self, key_id: impl Into<String>, secret: Vec<u8>) -> Self {
        self.key_id = key_id.into();
        self.codec = TokenCodec::new(self.key_id.clone(), &secret);
        self.signing_secret = secret;
        self
    }

    pub fn with_access_token_validity(mut self, validity: Duration) -> Self {
        self.access_token_validity = validity;
        self
    }

    pub fn with_refresh_token_validity(mut self, validity: Duration) -> Self {
        self.refresh_token_validity = validity;
        self
    }

    pub fn with_anti_csrf(mut self, enabled: bool) -> Self {
        self.anti_csrf = enabled;
        self
    }

    pub fn with_access_token_blacklisting(mut self, enabled: bool) -> Self {
        self.access_token_blacklisting = enabled;
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Snapshot handed out by `fetch_handshake_info`.
    pub fn handshake_info(&self) -> HandshakeInfo {
        let mut info = HandshakeInfo::new(self.key_id.clone(), &self.signing_secret);
        info.access_token_validity = self.access_token_validity;
        info.refresh_token_validity = self.refresh_token_validity;
        info.cookie_domain = self.cookie_domain.clone();
        info.cookie_same_site = self.cookie_same_site;
        info.refresh_token_path = self.refresh_token_path.clone();
        info.anti_csrf = self.anti_csrf;
        info.access_token_blacklisting = self.access_token_blacklisting;
        info
    }

    /// Mint an access token for `session`, bound to `anti_csrf` when given.
    pub fn issue_access_token(
        &self,
        session: &Session,
        anti_csrf: Option<String>,
        now: u64,
    ) -> Result<String, SessionError> {
        let claims = AccessClaims {
            sub: session.user_id.clone(),
            sid: session.session_handle.clone(),
            payload: session.payload.clone(),
            anti_csrf,
            token_type: TokenType::Access,
            iat: now,
            exp: now + self.access_token_validity.as_secs(),
        };
        Ok(self.codec.encode_access(&claims)?)
    }

    /// Mint a complete pair for `session`. Either every token is produced or
    /// the call fails.
    pub fn issue_tokens(&self, session: &Session, now: u64) -> Result<IssuedTokens, SessionError> {
        let anti_csrf = self.anti_csrf.then(generate_anti_csrf_token);
        let access_token = self.issue_access_token(session, anti_csrf.clone(), now)?;

        let refresh_jti = uuid::Uuid::new_v4().to_string();
        let expires_at = now + self.refresh_token_validity.as_secs();
        let refresh_token = self.codec.encode_refresh(&RefreshClaims {
            jti: refresh_jti.clone(),
            sid: session.session_handle.clone(),
            sub: session.user_id.clone(),
            token_type: TokenType::Refresh,
            iat: now,
            exp: expires_at,
        })?;

        Ok(IssuedTokens {
            pair: TokenPair {
                access_token,
                refresh_token,
                id_refresh_token: generate_id_refresh_token(),
                anti_csrf_token: anti_csrf,
            },
            refresh_jti,
            expires_at,
        })
    }
}
