//! Per-request session access for handlers.

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::callbacks::ErrorCallbacks;
use crate::error::SessionError;
use crate::session::{JwtPayload, PresentedTokens, Session, TokenPair};
use crate::store::SessionStore;

/// Tokens the gate must write to the response once the handler returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WriteBack {
    #[default]
    Nothing,
    /// Regenerated access token (payload update)
    AccessToken(String),
    /// Whole rotated pair (refresh)
    Pair(TokenPair),
    /// Session revoked, expire every cookie
    Clear,
}

/// State of one authenticated request, shared by the gate and every clone
/// of its [`SessionHandle`].
#[derive(Debug)]
pub struct RequestAuthContext {
    presented: PresentedTokens,
    session: Session,
    write_back: WriteBack,
}

impl RequestAuthContext {
    pub fn new(presented: PresentedTokens, session: Session) -> Self {
        Self {
            presented,
            session,
            write_back: WriteBack::Nothing,
        }
    }

    /// Context for a request whose tokens were just rotated.
    pub fn rotated(presented: PresentedTokens, session: Session, pair: TokenPair) -> Self {
        Self {
            presented,
            session,
            write_back: WriteBack::Pair(pair),
        }
    }

    pub fn presented(&self) -> &PresentedTokens {
        &self.presented
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn write_back(&self) -> &WriteBack {
        &self.write_back
    }

    pub fn take_write_back(&mut self) -> WriteBack {
        std::mem::take(&mut self.write_back)
    }

    fn record_payload_update(&mut self, session: Session, access_token: String) {
        self.session = session;
        self.write_back = match std::mem::take(&mut self.write_back) {
            WriteBack::Pair(mut pair) => {
                pair.access_token = access_token;
                WriteBack::Pair(pair)
            }
            WriteBack::Clear => WriteBack::Clear,
            WriteBack::Nothing | WriteBack::AccessToken(_) => WriteBack::AccessToken(access_token),
        };
    }

    fn record_revocation(&mut self) {
        self.write_back = WriteBack::Clear;
    }
}

/// The authenticated session of the current request.
#[derive(Clone)]
pub struct SessionHandle {
    store: Arc<SessionStore>,
    context: Arc<Mutex<RequestAuthContext>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", self.lock().session())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn new(store: Arc<SessionStore>, context: Arc<Mutex<RequestAuthContext>>) -> Self {
        Self { store, context }
    }

    fn lock(&self) -> MutexGuard<'_, RequestAuthContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user_id(&self) -> String {
        self.lock().session.user_id.clone()
    }

    pub fn session_handle(&self) -> String {
        self.lock().session.session_handle.clone()
    }

    /// Payload as last synchronized with the backend during this request.
    pub fn get_payload(&self) -> JwtPayload {
        self.lock().session.payload.clone()
    }

    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    /// Replace the payload. The regenerated access token is written to the
    /// response.
    pub async fn update_payload(&self, payload: JwtPayload) -> Result<(), SessionError> {
        let handle = self.session_handle();
        let update = self.store.update_payload(&handle, payload).await?;
        self.lock()
            .record_payload_update(update.session, update.access_token);
        Ok(())
    }

    /// Revoke this session. The response clears the session cookies.
    pub async fn revoke(&self) -> Result<(), SessionError> {
        let handle = self.session_handle();
        self.store.revoke(&handle).await?;
        self.lock().record_revocation();
        Ok(())
    }
}

/// Extractor for handlers behind the session gate.
pub struct ActiveSession(pub SessionHandle);

/// No session was attached to the request.
///
/// Only happens on routes the gate does not cover, so the rejection is
/// answered by the `Arc<ErrorCallbacks>` request extension when one is
/// installed, and by [`ErrorCallbacks::global`] otherwise.
#[derive(Debug)]
pub struct MissingSession {
    callbacks: Option<Arc<ErrorCallbacks>>,
}

impl IntoResponse for MissingSession {
    fn into_response(self) -> Response {
        let err = SessionError::unauthorized("No session for request");
        match &self.callbacks {
            Some(callbacks) => callbacks.respond(&err),
            None => ErrorCallbacks::global().respond(&err),
        }
    }
}

impl<S> FromRequestParts<S> for ActiveSession
where
    S: Send + Sync,
{
    type Rejection = MissingSession;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<SessionHandle>() {
            Some(handle) => Ok(ActiveSession(handle.clone())),
            None => Err(MissingSession {
                callbacks: parts.extensions.get::<Arc<ErrorCallbacks>>().cloned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            user_id: "u1".to_string(),
            session_handle: "h1".to_string(),
            payload: JwtPayload::new(),
        }
    }

    fn pair() -> TokenPair {
        TokenPair {
            access_token: "old-access".into(),
            refresh_token: "r".into(),
            id_refresh_token: "i".into(),
            anti_csrf_token: None,
        }
    }

    #[test]
    fn test_payload_update_after_rotation_keeps_pair() {
        let mut context = RequestAuthContext::rotated(PresentedTokens::default(), session(), pair());
        let mut updated = session();
        updated.payload = JwtPayload::new().with("k", 1);

        context.record_payload_update(updated.clone(), "new-access".to_string());
        assert_eq!(context.session(), &updated);
        match context.take_write_back() {
            WriteBack::Pair(pair) => {
                assert_eq!(pair.access_token, "new-access");
                assert_eq!(pair.refresh_token, "r");
            }
            other => panic!("unexpected write-back: {:?}", other),
        }
        assert_eq!(context.write_back(), &WriteBack::Nothing);
    }

    #[test]
    fn test_revocation_wins_over_later_update() {
        let mut context = RequestAuthContext::new(PresentedTokens::default(), session());
        context.record_payload_update(session(), "a1".to_string());
        assert_eq!(context.write_back(), &WriteBack::AccessToken("a1".to_string()));

        context.record_revocation();
        context.record_payload_update(session(), "a2".to_string());
        assert_eq!(context.write_back(), &WriteBack::Clear);
    }

    async fn missing_session_status(router: axum::Router) -> axum::http::StatusCode {
        use tower::ServiceExt;

        let request = axum::http::Request::builder()
            .uri("/")
            .body(axum::body::Body::empty())
            .unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_missing_session_uses_installed_callbacks() {
        use axum::{Extension, http::StatusCode, routing::get};

        async fn handler(ActiveSession(session): ActiveSession) -> String {
            session.user_id()
        }

        let callbacks = Arc::new(ErrorCallbacks::new());
        callbacks.on_unauthorized(|_: &SessionError| StatusCode::IM_A_TEAPOT.into_response());
        let router = axum::Router::new()
            .route("/", get(handler))
            .layer(Extension(callbacks));
        assert_eq!(
            missing_session_status(router).await,
            StatusCode::IM_A_TEAPOT
        );

        let router = axum::Router::new().route("/", get(handler));
        assert_eq!(
            missing_session_status(router).await,
            StatusCode::UNAUTHORIZED
        );
    }
}
