//! Endpoints used by client test suites.
//!
//! - POST `/beforeeach` - Reset call counters and the cached handshake info
//! - GET `/refreshCalledTime` - Number of successful refreshes
//! - GET `/getSessionCalledTime` - Number of authenticated `GET /` calls
//! - GET `/ping` - Empty 200
//! - GET `/testing` - Echo the `testing` request header
//! - GET `/testError` - Always 500
//! - GET `/fail` - Always 404
//! - GET `/testHeader` - `{"success": bool}`, whether the custom client header arrived
//! - GET `/checkDeviceInfo` - "true" when the client identified itself
//! - POST `/checkAllowCredentials` - "true" when `allow-credentials` was sent
//! - POST `/multipleInterceptors` - "success" when both interceptor headers arrived
//! - POST `/testUserConfig` - Empty 200

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::atomic::Ordering;
use tracing::info;

use super::DemoState;
use super::error::ApiError;

const TESTING_HEADER: &str = "testing";
const CUSTOM_HEADER: &str = "st-custom-header";
const SDK_NAME_HEADER: &str = "supertokens-sdk-name";
const SDK_VERSION_HEADER: &str = "supertokens-sdk-version";
const ALLOW_CREDENTIALS_HEADER: &str = "allow-credentials";
const INTERCEPTOR_HEADERS: [&str; 2] = ["interceptorheader1", "interceptorheader2"];

/// Whether `name` is present with a non-empty value.
fn has_header(headers: &HeaderMap, name: &str) -> bool {
    headers.get(name).is_some_and(|value| !value.is_empty())
}

pub fn router() -> Router<DemoState> {
    Router::new()
        .route("/beforeeach", post(before_each))
        .route("/refreshCalledTime", get(refresh_called_time))
        .route("/getSessionCalledTime", get(get_session_called_time))
        .route("/ping", get(ping))
        .route("/testing", get(testing))
        .route("/testError", get(test_error))
        .route("/fail", get(fail))
        .route("/testHeader", get(test_header))
        .route("/checkDeviceInfo", get(check_device_info))
        .route("/checkAllowCredentials", post(check_allow_credentials))
        .route("/multipleInterceptors", post(multiple_interceptors))
        .route("/testUserConfig", post(test_user_config))
}

async fn before_each(State(state): State<DemoState>) -> &'static str {
    state.counters.reset();
    state.gate.store().reset_handshake_info();
    info!("Counters and handshake info reset");
    ""
}

async fn refresh_called_time(State(state): State<DemoState>) -> String {
    state.counters.refresh.load(Ordering::SeqCst).to_string()
}

async fn get_session_called_time(State(state): State<DemoState>) -> String {
    state.counters.get_session.load(Ordering::SeqCst).to_string()
}

async fn ping() -> &'static str {
    ""
}

async fn testing(headers: HeaderMap) -> impl IntoResponse {
    let mut response_headers = HeaderMap::new();
    if let Some(value) = headers.get(TESTING_HEADER) {
        response_headers.insert(TESTING_HEADER, value.clone());
    }
    (response_headers, "success")
}

async fn test_error() -> ApiError {
    ApiError::internal("test error message")
}

async fn fail() -> ApiError {
    ApiError::not_found("Not found")
}

async fn test_header(headers: HeaderMap) -> Json<Value> {
    Json(json!({ "success": has_header(&headers, CUSTOM_HEADER) }))
}

async fn check_device_info(headers: HeaderMap) -> String {
    let from_website = headers
        .get(SDK_NAME_HEADER)
        .is_some_and(|value| value == "website");
    (from_website && has_header(&headers, SDK_VERSION_HEADER)).to_string()
}

async fn check_allow_credentials(headers: HeaderMap) -> String {
    has_header(&headers, ALLOW_CREDENTIALS_HEADER).to_string()
}

async fn multiple_interceptors(headers: HeaderMap) -> &'static str {
    if INTERCEPTOR_HEADERS
        .iter()
        .all(|name| has_header(&headers, name))
    {
        "success"
    } else {
        "failure"
    }
}

async fn test_user_config() -> &'static str {
    ""
}
