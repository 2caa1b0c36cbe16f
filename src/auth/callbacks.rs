//! Pluggable responses for rejected requests.
//!
//! One handler per [`ErrorReason`]. Registration replaces the whole handler
//! set atomically; a request renders its rejection with the snapshot it read,
//! so a concurrent registration never changes a response halfway.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use crate::error::{ErrorReason, SessionError};

/// Builds the response for a rejected request.
pub type ErrorHandler = Arc<dyn Fn(&SessionError) -> Response + Send + Sync>;

#[derive(Clone)]
struct Handlers {
    refresh_required: ErrorHandler,
    unauthorized: ErrorHandler,
    general_error: ErrorHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            refresh_required: Arc::new(|e: &SessionError| {
                default_response(StatusCode::UNAUTHORIZED, e)
            }),
            unauthorized: Arc::new(|e: &SessionError| {
                default_response(StatusCode::UNAUTHORIZED, e)
            }),
            general_error: Arc::new(|e: &SessionError| {
                default_response(StatusCode::INTERNAL_SERVER_ERROR, e)
            }),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
}

fn default_response(status: StatusCode, error: &SessionError) -> Response {
    let message = match error.reason() {
        // Backend details stay in the logs.
        ErrorReason::GeneralError => "Internal server error".to_string(),
        _ => error.to_string(),
    };
    (
        status,
        Json(ErrorBody {
            error: message,
            error_code: error.error_code(),
        }),
    )
        .into_response()
}

static GLOBAL: LazyLock<ErrorCallbacks> = LazyLock::new(ErrorCallbacks::new);

/// Registry of the three rejection handlers.
pub struct ErrorCallbacks {
    handlers: RwLock<Arc<Handlers>>,
}

impl std::fmt::Debug for ErrorCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorCallbacks").finish_non_exhaustive()
    }
}

impl Default for ErrorCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorCallbacks {
    /// A registry holding the default handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Handlers::default())),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static ErrorCallbacks {
        &GLOBAL
    }

    fn snapshot(&self) -> Arc<Handlers> {
        Arc::clone(&self.handlers.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update(&self, f: impl FnOnce(&mut Handlers)) {
        let mut guard = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Handlers::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn on_refresh_required<F>(&self, handler: F)
    where
        F: Fn(&SessionError) -> Response + Send + Sync + 'static,
    {
        self.update(|h| h.refresh_required = Arc::new(handler));
    }

    pub fn on_unauthorized<F>(&self, handler: F)
    where
        F: Fn(&SessionError) -> Response + Send + Sync + 'static,
    {
        self.update(|h| h.unauthorized = Arc::new(handler));
    }

    pub fn on_general_error<F>(&self, handler: F)
    where
        F: Fn(&SessionError) -> Response + Send + Sync + 'static,
    {
        self.update(|h| h.general_error = Arc::new(handler));
    }

    /// Restore the default handlers.
    pub fn reset(&self) {
        *self.handlers.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(Handlers::default());
    }

    /// Render `error` with the handler registered for its reason.
    pub fn respond(&self, error: &SessionError) -> Response {
        let handlers = self.snapshot();
        let handler = match error.reason() {
            ErrorReason::RefreshRequired => &handlers.refresh_required,
            ErrorReason::Unauthorized => &handlers.unauthorized,
            ErrorReason::GeneralError => &handlers.general_error,
        };
        handler(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let callbacks = ErrorCallbacks::new();
        assert_eq!(
            callbacks
                .respond(&SessionError::refresh_required("expired"))
                .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            callbacks.respond(&SessionError::SessionNotFound).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            callbacks
                .respond(&SessionError::unavailable("down"))
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_last_registration_wins() {
        let callbacks = ErrorCallbacks::new();
        callbacks.on_unauthorized(|_| StatusCode::FORBIDDEN.into_response());
        callbacks.on_unauthorized(|_| StatusCode::IM_A_TEAPOT.into_response());

        let err = SessionError::unauthorized("nope");
        assert_eq!(callbacks.respond(&err).status(), StatusCode::IM_A_TEAPOT);

        // Other slots are untouched.
        assert_eq!(
            callbacks
                .respond(&SessionError::refresh_required("expired"))
                .status(),
            StatusCode::UNAUTHORIZED
        );

        callbacks.reset();
        assert_eq!(callbacks.respond(&err).status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_snapshot_survives_registration() {
        let callbacks = ErrorCallbacks::new();
        let before = callbacks.snapshot();
        callbacks.on_general_error(|_| StatusCode::BAD_GATEWAY.into_response());

        let err = SessionError::unavailable("down");
        assert_eq!(
            (before.general_error)(&err).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(callbacks.respond(&err).status(), StatusCode::BAD_GATEWAY);
    }
}
