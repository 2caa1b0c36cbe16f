#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, Response, header},
};
use sessiongate::auth::{ANTI_CSRF_HEADER, ErrorCallbacks};
use sessiongate::backend::{BackendSettings, MemoryBackend, SessionBackend};
use sessiongate::{ServerConfig, SessionStore, create_app};
use std::sync::Arc;

pub const SECRET: &[u8] = b"test-secret-key-for-testing-1234";

pub fn settings() -> BackendSettings {
    BackendSettings::new(SECRET.to_vec())
}

/// Store over a fresh in-memory backend.
pub fn memory_store(settings: BackendSettings) -> (Arc<MemoryBackend>, Arc<SessionStore>) {
    let backend = Arc::new(MemoryBackend::new(settings));
    let store = Arc::new(SessionStore::new(backend.clone()));
    (backend, store)
}

/// Demo app with its own callback registry, so tests never touch the global one.
pub fn test_app(backend: Arc<dyn SessionBackend>) -> (Router, Arc<ErrorCallbacks>) {
    let callbacks = Arc::new(ErrorCallbacks::new());
    let config = ServerConfig {
        backend,
        secure_cookies: false,
        callbacks: Some(callbacks.clone()),
    };
    (create_app(&config), callbacks)
}

/// Every `Set-Cookie` header of a response.
pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Value a response assigned to cookie `name`, if any.
pub fn cookie_value(response: &Response<Body>, name: &str) -> Option<String> {
    set_cookies(response).into_iter().find_map(|cookie| {
        let pair = cookie.split(';').next()?;
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Browser-like cookie jar built from the `Set-Cookie` headers of responses.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, response: &Response<Body>) {
        for cookie in set_cookies(response) {
            let Some((name, value)) = cookie.split(';').next().and_then(|p| p.split_once('='))
            else {
                continue;
            };
            self.cookies.retain(|(n, _)| n != name);
            if !value.is_empty() {
                self.cookies.push((name.to_string(), value.to_string()));
            }
        }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.cookies.retain(|(n, _)| n != name);
        self.cookies.push((name.to_string(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn header(&self) -> String {
        self.cookies
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn request(method: &str, uri: &str, jar: &CookieJar) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if !jar.is_empty() {
        builder = builder.header(header::COOKIE, jar.header());
    }
    builder.body(Body::empty()).unwrap()
}

pub fn json_request(method: &str, uri: &str, jar: &CookieJar, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if !jar.is_empty() {
        builder = builder.header(header::COOKIE, jar.header());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn with_anti_csrf(mut request: Request<Body>, token: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert(ANTI_CSRF_HEADER, token.parse().unwrap());
    request
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}
