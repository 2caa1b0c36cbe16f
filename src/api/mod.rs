mod diagnostics;
mod error;
mod session;

use axum::{Extension, Router};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::auth::SessionGate;

pub use error::ApiError;

/// Call counters observed by client test suites. Reset via `/beforeeach`.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub get_session: AtomicUsize,
    pub refresh: AtomicUsize,
}

impl CallCounters {
    pub fn reset(&self) {
        self.get_session.store(0, Ordering::SeqCst);
        self.refresh.store(0, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct DemoState {
    pub gate: SessionGate,
    pub counters: Arc<CallCounters>,
}

/// Create the API router.
pub fn create_api_router(gate: SessionGate) -> Router {
    let callbacks = gate.isolated_callbacks();
    let state = DemoState {
        gate,
        counters: Arc::new(CallCounters::default()),
    };

    let router = Router::new()
        .merge(session::router(state.clone()))
        .merge(diagnostics::router())
        .with_state(state);

    // Handlers outside the gate answer missing sessions with the same registry.
    match callbacks {
        Some(callbacks) => router.layer(Extension(callbacks)),
        None => router,
    }
}
