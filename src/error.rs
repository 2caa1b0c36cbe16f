//! Session error taxonomy.
//!
//! Every failure of the session engine is a [`SessionError`]. The middleware
//! gate only cares about the coarse [`ErrorReason`] each error maps to, since
//! that selects the callback that produces the response.

/// The three rejection categories a request can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// Access token is stale but the refresh path is viable.
    RefreshRequired,
    /// No valid credential could be established.
    Unauthorized,
    /// Backend failure or any other unexpected condition.
    GeneralError,
}

/// Errors produced by the session engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Token failed structural or signature checks.
    MalformedToken,
    /// Token expiry has passed.
    ExpiredToken,
    /// No valid credential could be established.
    Unauthorized(String),
    /// The caller should call the refresh operation and retry.
    RefreshRequired(String),
    /// Transient backend failure (timeout, connection refused, ...).
    BackendUnavailable(String),
    /// Definitive backend refusal.
    BackendRejected(String),
    /// The targeted session handle no longer exists.
    SessionNotFound,
    /// A refresh token was presented after it had already been rotated.
    TokenTheftDetected {
        session_handle: String,
        user_id: String,
    },
}

impl SessionError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn refresh_required(msg: impl Into<String>) -> Self {
        Self::RefreshRequired(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::BackendRejected(msg.into())
    }

    /// Callback slot this error is routed to.
    pub fn reason(&self) -> ErrorReason {
        match self {
            SessionError::RefreshRequired(_) => ErrorReason::RefreshRequired,
            SessionError::MalformedToken
            | SessionError::ExpiredToken
            | SessionError::Unauthorized(_)
            | SessionError::SessionNotFound
            | SessionError::TokenTheftDetected { .. } => ErrorReason::Unauthorized,
            SessionError::BackendUnavailable(_) | SessionError::BackendRejected(_) => {
                ErrorReason::GeneralError
            }
        }
    }

    /// Stable machine-readable code, used in default error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::MalformedToken => "malformed_token",
            SessionError::ExpiredToken => "expired_token",
            SessionError::Unauthorized(_) => "unauthorized",
            SessionError::RefreshRequired(_) => "try_refresh_token",
            SessionError::BackendUnavailable(_) => "backend_unavailable",
            SessionError::BackendRejected(_) => "backend_rejected",
            SessionError::SessionNotFound => "session_not_found",
            SessionError::TokenTheftDetected { .. } => "token_theft_detected",
        }
    }

    /// Whether a bounded retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::BackendUnavailable(_))
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::MalformedToken => write!(f, "Token is malformed"),
            SessionError::ExpiredToken => write!(f, "Token has expired"),
            SessionError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            SessionError::RefreshRequired(msg) => write!(f, "Try refresh token: {}", msg),
            SessionError::BackendUnavailable(msg) => write!(f, "Backend unavailable: {}", msg),
            SessionError::BackendRejected(msg) => write!(f, "Backend rejected request: {}", msg),
            SessionError::SessionNotFound => write!(f, "Session not found"),
            SessionError::TokenTheftDetected { session_handle, .. } => {
                write!(f, "Token theft detected for session {}", session_handle)
            }
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            SessionError::refresh_required("expired").reason(),
            ErrorReason::RefreshRequired
        );
        assert_eq!(SessionError::MalformedToken.reason(), ErrorReason::Unauthorized);
        assert_eq!(SessionError::SessionNotFound.reason(), ErrorReason::Unauthorized);
        assert_eq!(
            SessionError::TokenTheftDetected {
                session_handle: "h".into(),
                user_id: "u".into(),
            }
            .reason(),
            ErrorReason::Unauthorized
        );
        assert_eq!(
            SessionError::unavailable("down").reason(),
            ErrorReason::GeneralError
        );
        assert_eq!(
            SessionError::rejected("nope").reason(),
            ErrorReason::GeneralError
        );
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(SessionError::unavailable("timeout").is_retryable());
        assert!(!SessionError::rejected("bad").is_retryable());
        assert!(!SessionError::unauthorized("x").is_retryable());
    }
}
