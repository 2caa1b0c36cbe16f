//! Session cookie parsing and `Set-Cookie` formatting.

use axum::http::{HeaderMap, HeaderValue, header};

use crate::handshake::{DEFAULT_REFRESH_TOKEN_VALIDITY, HandshakeInfo, SameSite};
use crate::session::TokenPair;

/// Cookie name for the access token.
pub const ACCESS_TOKEN_COOKIE: &str = "sAccessToken";

/// Cookie name for the refresh token.
pub const REFRESH_TOKEN_COOKIE: &str = "sRefreshToken";

/// Cookie name for the id-refresh token.
pub const ID_REFRESH_TOKEN_COOKIE: &str = "sIdRefreshToken";

/// Header carrying the anti-CSRF token, in both directions.
pub const ANTI_CSRF_HEADER: &str = "anti-csrf";

/// Extract a cookie value from the Cookie header.
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            if key.trim() == name {
                return Some(value.trim());
            }
        }
    }
    None
}

/// Attributes shared by every session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePolicy {
    pub domain: Option<String>,
    pub same_site: SameSite,
    pub refresh_token_path: String,
    /// Seconds. The access cookie outlives its token so that an expired
    /// token still reaches the server and can be answered with a refresh hint.
    pub max_age: u64,
    pub secure: bool,
}

impl CookiePolicy {
    pub fn new(info: &HandshakeInfo, secure: bool) -> Self {
        Self {
            domain: info.cookie_domain.clone(),
            same_site: info.cookie_same_site,
            refresh_token_path: info.refresh_token_path.clone(),
            max_age: info.refresh_token_validity.as_secs(),
            secure,
        }
    }

    /// Used to clear cookies when no handshake info is available.
    pub fn fallback(secure: bool) -> Self {
        Self {
            domain: None,
            same_site: SameSite::default(),
            refresh_token_path: "/".to_string(),
            max_age: DEFAULT_REFRESH_TOKEN_VALIDITY.as_secs(),
            secure,
        }
    }

    fn format(&self, name: &str, value: &str, path: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{}={}; HttpOnly; SameSite={}; Path={}; Max-Age={}",
            name,
            value,
            self.same_site.as_str(),
            path,
            max_age
        );
        if let Some(domain) = &self.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn access_token_cookie(&self, token: &str) -> String {
        self.format(ACCESS_TOKEN_COOKIE, token, "/", self.max_age)
    }

    /// Cookies for a whole pair.
    pub fn token_cookies(&self, pair: &TokenPair) -> Vec<String> {
        vec![
            self.access_token_cookie(&pair.access_token),
            self.format(
                REFRESH_TOKEN_COOKIE,
                &pair.refresh_token,
                &self.refresh_token_path,
                self.max_age,
            ),
            self.format(ID_REFRESH_TOKEN_COOKIE, &pair.id_refresh_token, "/", self.max_age),
        ]
    }

    /// Cookies expiring every session cookie.
    pub fn cleared_cookies(&self) -> Vec<String> {
        vec![
            self.format(ACCESS_TOKEN_COOKIE, "", "/", 0),
            self.format(REFRESH_TOKEN_COOKIE, "", &self.refresh_token_path, 0),
            self.format(ID_REFRESH_TOKEN_COOKIE, "", "/", 0),
        ]
    }
}

/// Append `Set-Cookie` headers. Values that are not valid header values are skipped.
pub fn append_cookies(headers: &mut HeaderMap, cookies: impl IntoIterator<Item = String>) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(header::SET_COOKIE, value);
        }
    }
}

/// Set the `anti-csrf` response header.
pub fn set_anti_csrf_header(headers: &mut HeaderMap, token: &str) {
    if let Ok(value) = HeaderValue::from_str(token) {
        headers.insert(ANTI_CSRF_HEADER, value);
    }
}
