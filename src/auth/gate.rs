//! Session gate: axum middleware that authenticates requests.
//!
//! `verify_session` guards ordinary routes. It never rotates tokens: an
//! expired access token is answered through the refresh-required callback and
//! the client is expected to call the refresh route. `refresh_session` guards
//! that refresh route only.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponseParts, Response, ResponseParts},
};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

use super::callbacks::ErrorCallbacks;
use super::cookie::{
    ACCESS_TOKEN_COOKIE, ANTI_CSRF_HEADER, CookiePolicy, ID_REFRESH_TOKEN_COOKIE,
    REFRESH_TOKEN_COOKIE, append_cookies, get_cookie, set_anti_csrf_header,
};
use super::handle::{RequestAuthContext, SessionHandle, WriteBack};
use crate::error::{ErrorReason, SessionError};
use crate::session::{JwtPayload, PresentedTokens, Session, TokenPair};
use crate::store::SessionStore;

#[derive(Clone)]
enum Registry {
    Global,
    Isolated(Arc<ErrorCallbacks>),
}

/// Shared state of the session middleware.
#[derive(Clone)]
pub struct SessionGate {
    store: Arc<SessionStore>,
    registry: Registry,
    secure_cookies: bool,
}

impl SessionGate {
    /// A gate answering rejections through [`ErrorCallbacks::global`].
    pub fn new(store: Arc<SessionStore>, secure_cookies: bool) -> Self {
        Self {
            store,
            registry: Registry::Global,
            secure_cookies,
        }
    }

    /// Use a private callback registry instead of the global one.
    pub fn with_callbacks(mut self, callbacks: Arc<ErrorCallbacks>) -> Self {
        self.registry = Registry::Isolated(callbacks);
        self
    }

    /// The private registry set with [`SessionGate::with_callbacks`], if any.
    pub fn isolated_callbacks(&self) -> Option<Arc<ErrorCallbacks>> {
        match &self.registry {
            Registry::Global => None,
            Registry::Isolated(callbacks) => Some(Arc::clone(callbacks)),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn callbacks(&self) -> &ErrorCallbacks {
        match &self.registry {
            Registry::Global => ErrorCallbacks::global(),
            Registry::Isolated(callbacks) => callbacks,
        }
    }

    async fn cookie_policy(&self) -> CookiePolicy {
        let info = match self.store.cached_handshake() {
            Some(info) => Some(info),
            None => self.store.handshake().await.ok(),
        };
        match info {
            Some(info) => CookiePolicy::new(&info, self.secure_cookies),
            None => CookiePolicy::fallback(self.secure_cookies),
        }
    }

    /// Answer a failed session operation through the matching callback.
    /// Unauthorized rejections also expire the session cookies.
    pub async fn reject(&self, err: &SessionError) -> Response {
        match err.reason() {
            ErrorReason::GeneralError => error!(error = %err, "Session check failed"),
            reason => debug!(error = %err, ?reason, "Request rejected"),
        }

        let mut response = self.callbacks().respond(err);
        if err.reason() == ErrorReason::Unauthorized {
            let policy = match self.store.cached_handshake() {
                Some(info) => CookiePolicy::new(&info, self.secure_cookies),
                None => CookiePolicy::fallback(self.secure_cookies),
            };
            append_cookies(response.headers_mut(), policy.cleared_cookies());
        }
        response
    }

    /// Start a session. The returned value writes the new tokens into a response.
    pub async fn create_new_session(
        &self,
        user_id: &str,
        payload: JwtPayload,
    ) -> Result<NewSession, SessionError> {
        let issued = self.store.create_session(user_id, payload).await?;
        let policy = self.cookie_policy().await;
        Ok(NewSession {
            session: issued.session,
            cookies: policy.token_cookies(&issued.tokens),
            anti_csrf_token: issued.tokens.anti_csrf_token,
        })
    }

    async fn write_back(&self, context: &Mutex<RequestAuthContext>, response: &mut Response) {
        let write_back = context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_write_back();
        if write_back == WriteBack::Nothing {
            return;
        }

        let policy = self.cookie_policy().await;
        let headers = response.headers_mut();
        match write_back {
            WriteBack::Nothing => {}
            WriteBack::AccessToken(token) => {
                append_cookies(headers, [policy.access_token_cookie(&token)]);
            }
            WriteBack::Pair(pair) => write_pair(headers, &policy, &pair),
            WriteBack::Clear => append_cookies(headers, policy.cleared_cookies()),
        }
    }

    async fn run_authenticated(
        &self,
        context: RequestAuthContext,
        mut request: Request,
        next: Next,
    ) -> Response {
        let context = Arc::new(Mutex::new(context));
        request
            .extensions_mut()
            .insert(SessionHandle::new(Arc::clone(&self.store), Arc::clone(&context)));

        let mut response = next.run(request).await;
        self.write_back(&context, &mut response).await;
        response
    }
}

fn write_pair(headers: &mut HeaderMap, policy: &CookiePolicy, pair: &TokenPair) {
    append_cookies(headers, policy.token_cookies(pair));
    if let Some(token) = &pair.anti_csrf_token {
        set_anti_csrf_header(headers, token);
    }
}

/// Token components carried by request cookies and headers.
pub fn presented_tokens(headers: &HeaderMap) -> PresentedTokens {
    let owned = |value: Option<&str>| value.filter(|v| !v.is_empty()).map(str::to_string);
    PresentedTokens {
        access_token: owned(get_cookie(headers, ACCESS_TOKEN_COOKIE)),
        refresh_token: owned(get_cookie(headers, REFRESH_TOKEN_COOKIE)),
        id_refresh_token: owned(get_cookie(headers, ID_REFRESH_TOKEN_COOKIE)),
        anti_csrf_token: owned(
            headers
                .get(ANTI_CSRF_HEADER)
                .and_then(|value| value.to_str().ok()),
        ),
    }
}

/// Only state-changing requests need to prove they are not cross-site.
fn needs_anti_csrf_check(method: &Method) -> bool {
    ![Method::GET, Method::HEAD, Method::OPTIONS].contains(method)
}

/// Middleware for protected routes.
pub async fn verify_session(
    State(gate): State<SessionGate>,
    request: Request,
    next: Next,
) -> Response {
    let presented = presented_tokens(request.headers());
    if presented.id_refresh_token.is_none() {
        return gate
            .reject(&SessionError::unauthorized("Missing id-refresh token"))
            .await;
    }

    let check_anti_csrf = needs_anti_csrf_check(request.method());
    match gate
        .store
        .validate_and_maybe_refresh(&presented, check_anti_csrf)
        .await
    {
        Ok(session) => {
            gate.run_authenticated(RequestAuthContext::new(presented, session), request, next)
                .await
        }
        Err(e) => gate.reject(&e).await,
    }
}

/// Middleware for the refresh route: rotates the pair before the handler runs.
pub async fn refresh_session(
    State(gate): State<SessionGate>,
    request: Request,
    next: Next,
) -> Response {
    let presented = presented_tokens(request.headers());
    let Some(refresh_token) = presented.refresh_token.clone() else {
        return gate
            .reject(&SessionError::unauthorized("Missing refresh token"))
            .await;
    };

    match gate.store.refresh(&refresh_token).await {
        Ok(issued) => {
            let context = RequestAuthContext::rotated(presented, issued.session, issued.tokens);
            gate.run_authenticated(context, request, next).await
        }
        Err(e) => gate.reject(&e).await,
    }
}

/// A freshly created session, ready to be written into a response.
#[derive(Debug)]
pub struct NewSession {
    pub session: Session,
    cookies: Vec<String>,
    anti_csrf_token: Option<String>,
}

impl IntoResponseParts for NewSession {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        append_cookies(res.headers_mut(), self.cookies);
        if let Some(token) = &self.anti_csrf_token {
            set_anti_csrf_header(res.headers_mut(), token);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header};

    #[test]
    fn test_presented_tokens_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("sAccessToken=a; sRefreshToken=; sIdRefreshToken=i"),
        );
        headers.insert(ANTI_CSRF_HEADER, HeaderValue::from_static("csrf"));

        let presented = presented_tokens(&headers);
        assert_eq!(presented.access_token.as_deref(), Some("a"));
        assert_eq!(presented.refresh_token, None);
        assert_eq!(presented.id_refresh_token.as_deref(), Some("i"));
        assert_eq!(presented.anti_csrf_token.as_deref(), Some("csrf"));
    }

    #[test]
    fn test_safe_methods_skip_anti_csrf() {
        assert!(!needs_anti_csrf_check(&Method::GET));
        assert!(!needs_anti_csrf_check(&Method::HEAD));
        assert!(!needs_anti_csrf_check(&Method::OPTIONS));
        assert!(needs_anti_csrf_check(&Method::POST));
        assert!(needs_anti_csrf_check(&Method::DELETE));
    }
}
