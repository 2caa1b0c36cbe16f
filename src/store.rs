//! Session store: the operations application code and the gate call.
//!
//! Access tokens are validated locally with the cached handshake key. Every
//! other operation goes to the backend. Mutating calls run on their own task
//! so that a dropped request future cannot abandon a half-applied change.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::SessionBackend;
use crate::codec::{anti_csrf_matches, token_key_id, unix_now};
use crate::error::SessionError;
use crate::handshake::{HandshakeCache, HandshakeInfo};
use crate::session::{
    IssuedSession, JwtPayload, PayloadUpdate, PresentedTokens, Session, TokenPair,
};

pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    handshake: HandshakeCache,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            handshake: HandshakeCache::new(Arc::clone(&backend)),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    /// Current handshake info, fetched on a miss.
    pub async fn handshake(&self) -> Result<Arc<HandshakeInfo>, SessionError> {
        with_retry(|| self.handshake.get()).await
    }

    /// Forget the cached handshake info. The next operation fetches it again.
    pub fn reset_handshake_info(&self) {
        self.handshake.invalidate();
    }

    /// Cached handshake info, if any. Never reaches the backend.
    pub fn cached_handshake(&self) -> Option<Arc<HandshakeInfo>> {
        self.handshake.cached()
    }

    /// Handshake info able to verify `token`. When the token names another
    /// key version the cache is refreshed at most once.
    async fn handshake_for(&self, token: &str) -> Result<Arc<HandshakeInfo>, SessionError> {
        match token_key_id(token) {
            Some(kid) => with_retry(|| self.handshake.get_for_key(&kid)).await,
            None => self.handshake().await,
        }
    }

    /// Start a new session for `user_id`.
    pub async fn create_session(
        &self,
        user_id: &str,
        payload: JwtPayload,
    ) -> Result<IssuedSession, SessionError> {
        let info = self.handshake().await?;

        let backend = Arc::clone(&self.backend);
        let owned_user_id = user_id.to_string();
        let issued =
            detached(async move { backend.create_session(&owned_user_id, &payload).await }).await?;

        if let Err(e) = check_pair(&info, &issued.tokens) {
            // The backend created a session nobody can use.
            let backend = Arc::clone(&self.backend);
            let handle = issued.session.session_handle.clone();
            if let Err(revoke_error) =
                detached(async move { backend.revoke_session(&handle).await }).await
            {
                warn!(
                    session = %issued.session.session_handle,
                    error = %revoke_error,
                    "Failed to revoke session with incomplete tokens"
                );
            }
            return Err(e);
        }
        info!(
            user_id = %issued.session.user_id,
            session = %issued.session.session_handle,
            "Session created"
        );
        Ok(issued)
    }

    /// Authenticate a request from the tokens it carried.
    ///
    /// A missing, corrupted or expired access token yields `RefreshRequired`
    /// when the presented refresh token is still good, `Unauthorized`
    /// otherwise. The anti-CSRF comparison only happens when `check_anti_csrf`
    /// is set and the handshake enables it.
    pub async fn validate_and_maybe_refresh(
        &self,
        presented: &PresentedTokens,
        check_anti_csrf: bool,
    ) -> Result<Session, SessionError> {
        let now = unix_now();
        let Some(access_token) = presented.access_token.as_deref() else {
            let info = self.handshake().await?;
            return Err(refresh_or_unauthorized(
                &info,
                presented,
                now,
                "Missing access token",
            ));
        };

        let info = self.handshake_for(access_token).await?;
        let claims = match info.codec().decode_access(access_token, now) {
            Ok(claims) => claims,
            Err(e) => {
                return Err(refresh_or_unauthorized(
                    &info,
                    presented,
                    now,
                    &e.to_string(),
                ));
            }
        };

        if info.anti_csrf && check_anti_csrf {
            let expected = claims.anti_csrf.as_deref();
            let matches = match (expected, presented.anti_csrf_token.as_deref()) {
                (Some(expected), Some(given)) => anti_csrf_matches(expected, given),
                _ => false,
            };
            if !matches {
                return Err(SessionError::refresh_required(
                    "Anti-CSRF token missing or mismatched",
                ));
            }
        }

        if !info.access_token_blacklisting {
            return Ok(Session {
                user_id: claims.sub,
                session_handle: claims.sid,
                payload: claims.payload,
            });
        }

        match with_retry(|| self.backend.validate_session(&claims.sid)).await {
            Ok(session) if session.user_id == claims.sub => Ok(session),
            Ok(_) => Err(SessionError::unauthorized("Session belongs to another user")),
            Err(SessionError::SessionNotFound) => {
                Err(SessionError::unauthorized("Session has been revoked"))
            }
            Err(e) => Err(e),
        }
    }

    /// Rotate the token pair. The presented refresh token stops working.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedSession, SessionError> {
        let info = self.handshake_for(refresh_token).await?;
        if let Err(e) = info.codec().decode_refresh(refresh_token, unix_now()) {
            return Err(SessionError::unauthorized(e.to_string()));
        }

        let backend = Arc::clone(&self.backend);
        let token = refresh_token.to_string();
        let result = detached(async move { backend.refresh_session(&token).await }).await;

        let issued = match result {
            Ok(issued) => issued,
            Err(SessionError::TokenTheftDetected {
                session_handle,
                user_id,
            }) => {
                warn!(
                    session = %session_handle,
                    user_id = %user_id,
                    "Refresh token reuse detected, revoking session"
                );
                if let Err(e) = self.revoke(&session_handle).await {
                    warn!(
                        error = %e,
                        session = %session_handle,
                        "Failed to revoke session after token reuse"
                    );
                }
                return Err(SessionError::unauthorized("Refresh token has already been used"));
            }
            Err(SessionError::SessionNotFound) => {
                return Err(SessionError::unauthorized("Session no longer exists"));
            }
            Err(e) => return Err(e),
        };

        check_pair(&info, &issued.tokens)?;
        debug!(session = %issued.session.session_handle, "Session refreshed");
        Ok(issued)
    }

    /// Revoke one session. Unknown or already revoked handles succeed.
    pub async fn revoke(&self, session_handle: &str) -> Result<(), SessionError> {
        let backend = Arc::clone(&self.backend);
        let handle = session_handle.to_string();
        let result =
            detached(async move { with_retry(|| backend.revoke_session(&handle)).await }).await;

        match result {
            Ok(removed) => {
                if removed {
                    info!(session = %session_handle, "Session revoked");
                }
                Ok(())
            }
            Err(SessionError::SessionNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Revoke every session of a user. Returns how many were revoked.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<usize, SessionError> {
        let backend = Arc::clone(&self.backend);
        let owned_user_id = user_id.to_string();
        let count =
            detached(async move { backend.revoke_all_sessions_for_user(&owned_user_id).await })
                .await?;
        info!(user_id = %user_id, count, "Revoked all sessions for user");
        Ok(count)
    }

    /// Replace the payload of a session. The returned access token carries
    /// the new payload.
    pub async fn update_payload(
        &self,
        session_handle: &str,
        payload: JwtPayload,
    ) -> Result<PayloadUpdate, SessionError> {
        let backend = Arc::clone(&self.backend);
        let handle = session_handle.to_string();
        detached(async move { backend.update_payload(&handle, &payload).await }).await
    }
}

fn refresh_or_unauthorized(
    info: &HandshakeInfo,
    presented: &PresentedTokens,
    now: u64,
    reason: &str,
) -> SessionError {
    let refresh_ok = presented
        .refresh_token
        .as_deref()
        .is_some_and(|token| info.codec().decode_refresh(token, now).is_ok());

    if refresh_ok {
        SessionError::refresh_required(reason)
    } else {
        SessionError::unauthorized(reason)
    }
}

/// A pair is only handed out whole.
fn check_pair(info: &HandshakeInfo, pair: &TokenPair) -> Result<(), SessionError> {
    let incomplete = pair.access_token.is_empty()
        || pair.refresh_token.is_empty()
        || pair.id_refresh_token.is_empty()
        || (info.anti_csrf && pair.anti_csrf_token.is_none());

    if incomplete {
        warn!("Backend returned an incomplete token pair");
        return Err(SessionError::rejected("Incomplete token pair"));
    }
    Ok(())
}

/// Run a backend call on its own task. It runs to completion even if the
/// caller stops waiting.
async fn detached<T, F>(fut: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, SessionError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| SessionError::unavailable(format!("backend task failed: {}", e)))?
}

/// One extra attempt after `BackendUnavailable`. Only for idempotent calls.
async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    match op().await {
        Err(e) if e.is_retryable() => {
            debug!(error = %e, "Retrying backend call");
            op().await
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSettings, MemoryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SECRET: &[u8] = b"test-secret-key-for-testing-1234";

    fn store_with(settings: BackendSettings) -> (Arc<MemoryBackend>, SessionStore) {
        let backend = Arc::new(MemoryBackend::new(settings));
        let store = SessionStore::new(backend.clone());
        (backend, store)
    }

    #[tokio::test]
    async fn test_with_retry_retries_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), SessionError> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::unavailable("down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_terminal_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), SessionError> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::SessionNotFound)
        })
        .await;
        assert_eq!(result, Err(SessionError::SessionNotFound));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_check_pair_requires_anti_csrf_when_enabled() {
        let mut info = HandshakeInfo::new("k1", SECRET);
        let pair = TokenPair {
            access_token: "a".into(),
            refresh_token: "r".into(),
            id_refresh_token: "i".into(),
            anti_csrf_token: None,
        };
        assert!(check_pair(&info, &pair).is_ok());

        info.anti_csrf = true;
        assert!(matches!(
            check_pair(&info, &pair),
            Err(SessionError::BackendRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_access_token_with_valid_refresh_token() {
        let (_, store) = store_with(BackendSettings::new(SECRET.to_vec()));
        let issued = store.create_session("u1", JwtPayload::new()).await.unwrap();

        let mut presented = PresentedTokens::from(&issued.tokens);
        presented.access_token = None;
        let err = store
            .validate_and_maybe_refresh(&presented, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::RefreshRequired(_)));

        presented.refresh_token = None;
        let err = store
            .validate_and_maybe_refresh(&presented, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_without_blacklisting_payload_comes_from_token() {
        let (backend, store) = store_with(
            BackendSettings::new(SECRET.to_vec()).with_access_token_blacklisting(false),
        );
        let payload = JwtPayload::new().with("k", "v");
        let issued = store.create_session("u1", payload.clone()).await.unwrap();
        store.revoke(&issued.session.session_handle).await.unwrap();
        assert_eq!(backend.active_sessions().await, 0);

        // Revocation is not visible until the access token expires.
        let session = store
            .validate_and_maybe_refresh(&PresentedTokens::from(&issued.tokens), false)
            .await
            .unwrap();
        assert_eq!(session.payload, payload);
    }

    #[tokio::test]
    async fn test_refresh_with_backend_down_is_unavailable() {
        let (backend, store) = store_with(BackendSettings::new(SECRET.to_vec()));
        let issued = store.create_session("u1", JwtPayload::new()).await.unwrap();

        backend.set_available(false);
        let err = store
            .refresh(&issued.tokens.refresh_token)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::BackendUnavailable(_)));

        // The token was not consumed.
        backend.set_available(true);
        assert!(store.refresh(&issued.tokens.refresh_token).await.is_ok());
    }
}
