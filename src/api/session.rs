//! Session endpoints.
//!
//! - POST `/login` - Create a session for `{"userId": ...}`
//! - GET `/` - Return the user id of the current session
//! - POST `/logout` - Revoke the current session
//! - POST `/revokeAll` - Revoke every session of the current user
//! - POST `/refresh` - Rotate the token pair
//! - GET `/update-jwt` - Return the current payload
//! - POST `/update-jwt` - Replace the payload with the request body

use axum::{
    Json, Router,
    extract::State,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::atomic::Ordering;

use super::DemoState;
use super::error::validate_user_id;
use crate::auth::{ActiveSession, refresh_session, verify_session};
use crate::session::JwtPayload;

pub fn router(state: DemoState) -> Router<DemoState> {
    let protected = Router::new()
        .route("/", get(get_session))
        .route("/logout", post(logout))
        .route("/revokeAll", post(revoke_all))
        .route("/update-jwt", get(get_jwt).post(update_jwt))
        .route_layer(middleware::from_fn_with_state(
            state.gate.clone(),
            verify_session,
        ));

    let refresh = Router::new()
        .route("/refresh", post(refresh))
        .route_layer(middleware::from_fn_with_state(
            state.gate.clone(),
            refresh_session,
        ));

    Router::new()
        .route("/login", post(login))
        .merge(protected)
        .merge(refresh)
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(rename = "userId")]
    user_id: String,
}

async fn login(State(state): State<DemoState>, Json(req): Json<LoginRequest>) -> Response {
    if let Err(e) = validate_user_id(&req.user_id) {
        return e.into_response();
    }

    match state
        .gate
        .create_new_session(&req.user_id, JwtPayload::new())
        .await
    {
        Ok(new_session) => (new_session, req.user_id).into_response(),
        Err(e) => state.gate.reject(&e).await,
    }
}

async fn get_session(
    State(state): State<DemoState>,
    ActiveSession(session): ActiveSession,
) -> String {
    state.counters.get_session.fetch_add(1, Ordering::SeqCst);
    session.user_id()
}

async fn logout(State(state): State<DemoState>, ActiveSession(session): ActiveSession) -> Response {
    match session.revoke().await {
        Ok(()) => "success".into_response(),
        Err(e) => state.gate.reject(&e).await,
    }
}

async fn revoke_all(
    State(state): State<DemoState>,
    ActiveSession(session): ActiveSession,
) -> Response {
    let user_id = session.user_id();
    match state.gate.store().revoke_all_for_user(&user_id).await {
        Ok(_) => "success".into_response(),
        Err(e) => state.gate.reject(&e).await,
    }
}

async fn refresh(State(state): State<DemoState>) -> &'static str {
    state.counters.refresh.fetch_add(1, Ordering::SeqCst);
    "refresh success"
}

async fn get_jwt(ActiveSession(session): ActiveSession) -> Json<JwtPayload> {
    Json(session.get_payload())
}

async fn update_jwt(
    State(state): State<DemoState>,
    ActiveSession(session): ActiveSession,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    match session.update_payload(JwtPayload::from(body)).await {
        Ok(()) => Json(session.get_payload()).into_response(),
        Err(e) => state.gate.reject(&e).await,
    }
}
