//! In-process backend.
//!
//! Keeps every session in one map behind a single async mutex, which makes
//! refresh-token rotation linearizable. Also exposes a few knobs (fetch
//! counter, availability switch, latency, key rotation) for exercising the
//! store's failure handling.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use super::{BackendSettings, SessionBackend};
use crate::codec::unix_now;
use crate::error::SessionError;
use crate::handshake::HandshakeInfo;
use crate::session::{IssuedSession, JwtPayload, PayloadUpdate, Session};

struct SessionRecord {
    user_id: String,
    payload: JwtPayload,
    refresh_jti: String,
    anti_csrf: Option<String>,
    expires_at: u64,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    /// Rotated refresh token JTIs, mapped to their session handle
    consumed: HashMap<String, String>,
}

impl MemoryState {
    fn remove_session(&mut self, session_handle: &str) -> Option<SessionRecord> {
        self.consumed.retain(|_, handle| handle != session_handle);
        self.sessions.remove(session_handle)
    }

    fn live_session(&mut self, session_handle: &str, now: u64) -> Option<&mut SessionRecord> {
        let expired = self
            .sessions
            .get(session_handle)
            .is_some_and(|record| record.expires_at <= now);
        if expired {
            self.remove_session(session_handle);
            return None;
        }
        self.sessions.get_mut(session_handle)
    }
}

pub struct MemoryBackend {
    settings: RwLock<BackendSettings>,
    state: Mutex<MemoryState>,
    handshake_fetches: AtomicUsize,
    handshake_delay_ms: AtomicU64,
    mutation_delay_ms: AtomicU64,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            state: Mutex::new(MemoryState::default()),
            handshake_fetches: AtomicUsize::new(0),
            handshake_delay_ms: AtomicU64::new(0),
            mutation_delay_ms: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    fn settings(&self) -> BackendSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_available(&self) -> Result<(), SessionError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::unavailable("memory backend is offline"))
        }
    }

    /// Number of `fetch_handshake_info` calls received, including failed ones.
    pub fn handshake_fetches(&self) -> usize {
        self.handshake_fetches.load(Ordering::SeqCst)
    }

    /// Simulate an outage: every call fails with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied to every handshake fetch.
    pub fn set_handshake_delay(&self, delay: Duration) {
        self.handshake_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay applied before every state-changing call takes effect.
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.mutation_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn mutation_latency(&self) {
        let delay = self.mutation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Switch to a new signing key. Sessions survive; tokens issued from now
    /// on carry the new key id.
    pub fn rotate_signing_key(&self, key_id: &str, secret: Vec<u8>) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        *settings = settings.clone().with_signing_key(key_id, secret);
    }

    pub async fn active_sessions(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}

impl SessionBackend for MemoryBackend {
    fn fetch_handshake_info(&self) -> BoxFuture<'_, Result<HandshakeInfo, SessionError>> {
        async move {
            self.handshake_fetches.fetch_add(1, Ordering::SeqCst);
            let delay = self.handshake_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.check_available()?;
            Ok(self.settings().handshake_info())
        }
        .boxed()
    }

    fn create_session<'a>(
        &'a self,
        user_id: &'a str,
        payload: &'a JwtPayload,
    ) -> BoxFuture<'a, Result<IssuedSession, SessionError>> {
        async move {
            self.mutation_latency().await;
            self.check_available()?;
            let session = Session {
                user_id: user_id.to_string(),
                session_handle: uuid::Uuid::new_v4().to_string(),
                payload: payload.clone(),
            };
            let issued = self.settings().issue_tokens(&session, unix_now())?;

            self.state.lock().await.sessions.insert(
                session.session_handle.clone(),
                SessionRecord {
                    user_id: session.user_id.clone(),
                    payload: session.payload.clone(),
                    refresh_jti: issued.refresh_jti,
                    anti_csrf: issued.pair.anti_csrf_token.clone(),
                    expires_at: issued.expires_at,
                },
            );

            Ok(IssuedSession {
                tokens: issued.pair,
                session,
            })
        }
        .boxed()
    }

    fn validate_session<'a>(
        &'a self,
        session_handle: &'a str,
    ) -> BoxFuture<'a, Result<Session, SessionError>> {
        async move {
            self.check_available()?;
            let mut state = self.state.lock().await;
            let record = state
                .live_session(session_handle, unix_now())
                .ok_or(SessionError::SessionNotFound)?;
            Ok(Session {
                user_id: record.user_id.clone(),
                session_handle: session_handle.to_string(),
                payload: record.payload.clone(),
            })
        }
        .boxed()
    }

    fn refresh_session<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<IssuedSession, SessionError>> {
        async move {
            self.mutation_latency().await;
            self.check_available()?;
            let settings = self.settings();
            let now = unix_now();
            let claims = settings
                .codec()
                .decode_refresh(refresh_token, now)
                .map_err(|_| SessionError::unauthorized("Invalid refresh token"))?;

            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if let Some(session_handle) = state.consumed.get(&claims.jti).cloned() {
                let user_id = state
                    .remove_session(&session_handle)
                    .map(|record| record.user_id)
                    .unwrap_or(claims.sub);
                warn!(session = %session_handle, "Rotated refresh token presented again");
                return Err(SessionError::TokenTheftDetected {
                    session_handle,
                    user_id,
                });
            }

            let record = state
                .live_session(&claims.sid, now)
                .filter(|record| record.refresh_jti == claims.jti)
                .ok_or_else(|| SessionError::unauthorized("Refresh token is no longer valid"))?;

            let session = Session {
                user_id: record.user_id.clone(),
                session_handle: claims.sid.clone(),
                payload: record.payload.clone(),
            };
            let issued = settings.issue_tokens(&session, now)?;

            let old_jti = std::mem::replace(&mut record.refresh_jti, issued.refresh_jti);
            record.anti_csrf = issued.pair.anti_csrf_token.clone();
            record.expires_at = issued.expires_at;
            state.consumed.insert(old_jti, claims.sid);

            Ok(IssuedSession {
                tokens: issued.pair,
                session,
            })
        }
        .boxed()
    }

    fn revoke_session<'a>(
        &'a self,
        session_handle: &'a str,
    ) -> BoxFuture<'a, Result<bool, SessionError>> {
        async move {
            self.mutation_latency().await;
            self.check_available()?;
            let mut state = self.state.lock().await;
            Ok(state.remove_session(session_handle).is_some())
        }
        .boxed()
    }

    fn revoke_all_sessions_for_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<usize, SessionError>> {
        async move {
            self.mutation_latency().await;
            self.check_available()?;
            let mut state = self.state.lock().await;
            let handles: Vec<String> = state
                .sessions
                .iter()
                .filter(|(_, record)| record.user_id == user_id)
                .map(|(handle, _)| handle.clone())
                .collect();
            for handle in &handles {
                state.remove_session(handle);
            }
            Ok(handles.len())
        }
        .boxed()
    }

    fn update_payload<'a>(
        &'a self,
        session_handle: &'a str,
        payload: &'a JwtPayload,
    ) -> BoxFuture<'a, Result<PayloadUpdate, SessionError>> {
        async move {
            self.mutation_latency().await;
            self.check_available()?;
            let now = unix_now();
            let mut state = self.state.lock().await;
            let record = state
                .live_session(session_handle, now)
                .ok_or(SessionError::SessionNotFound)?;
            record.payload = payload.clone();

            let session = Session {
                user_id: record.user_id.clone(),
                session_handle: session_handle.to_string(),
                payload: payload.clone(),
            };
            let access_token =
                self.settings()
                    .issue_access_token(&session, record.anti_csrf.clone(), now)?;

            Ok(PayloadUpdate {
                session,
                access_token,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(BackendSettings::new(b"test-secret-key-for-testing".to_vec()))
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let backend = backend();
        let payload = JwtPayload::new().with("a", 1);
        let issued = backend.create_session("u1", &payload).await.unwrap();

        let session = backend
            .validate_session(&issued.session.session_handle)
            .await
            .unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.payload, payload);
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_detects_reuse() {
        let backend = backend();
        let issued = backend.create_session("u1", &JwtPayload::new()).await.unwrap();

        let rotated = backend
            .refresh_session(&issued.tokens.refresh_token)
            .await
            .unwrap();
        assert_ne!(rotated.tokens.refresh_token, issued.tokens.refresh_token);
        assert_eq!(rotated.session.session_handle, issued.session.session_handle);

        let reused = backend.refresh_session(&issued.tokens.refresh_token).await;
        assert!(matches!(
            reused,
            Err(SessionError::TokenTheftDetected { ref user_id, .. }) if user_id == "u1"
        ));

        // The whole session is gone after theft detection.
        assert_eq!(backend.active_sessions().await, 0);
        assert!(
            backend
                .refresh_session(&rotated.tokens.refresh_token)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_revoke_reports_whether_removed() {
        let backend = backend();
        let issued = backend.create_session("u1", &JwtPayload::new()).await.unwrap();
        let handle = issued.session.session_handle;

        assert!(backend.revoke_session(&handle).await.unwrap());
        assert!(!backend.revoke_session(&handle).await.unwrap());
        assert_eq!(
            backend.validate_session(&handle).await,
            Err(SessionError::SessionNotFound)
        );
    }

    #[tokio::test]
    async fn test_expired_session_is_not_found() {
        let backend = MemoryBackend::new(
            BackendSettings::new(b"test-secret-key-for-testing".to_vec())
                .with_refresh_token_validity(Duration::ZERO),
        );
        let issued = backend.create_session("u1", &JwtPayload::new()).await.unwrap();
        assert_eq!(
            backend.validate_session(&issued.session.session_handle).await,
            Err(SessionError::SessionNotFound)
        );
    }

    #[tokio::test]
    async fn test_offline_backend_fails_every_call() {
        let backend = backend();
        backend.set_available(false);
        assert!(matches!(
            backend.create_session("u1", &JwtPayload::new()).await,
            Err(SessionError::BackendUnavailable(_))
        ));
        assert!(backend.fetch_handshake_info().await.is_err());
        assert_eq!(backend.handshake_fetches(), 1);
    }
}
