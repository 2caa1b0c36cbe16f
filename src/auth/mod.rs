//! HTTP side of the session engine.
//!
//! The gate reads tokens from cookies, authenticates through the
//! [`SessionStore`](crate::store::SessionStore), hands a [`SessionHandle`] to
//! the handler, then writes any new tokens back. Rejections are rendered by
//! the [`ErrorCallbacks`] registry.

mod callbacks;
mod cookie;
mod gate;
mod handle;

pub use callbacks::{ErrorCallbacks, ErrorHandler};
pub use cookie::{
    ACCESS_TOKEN_COOKIE, ANTI_CSRF_HEADER, CookiePolicy, ID_REFRESH_TOKEN_COOKIE,
    REFRESH_TOKEN_COOKIE, get_cookie,
};
pub use gate::{NewSession, SessionGate, presented_tokens, refresh_session, verify_session};
pub use handle::{ActiveSession, MissingSession, RequestAuthContext, SessionHandle, WriteBack};
