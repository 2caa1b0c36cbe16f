pub mod api;
pub mod auth;
pub mod backend;
pub mod cleanup;
pub mod cli;
pub mod codec;
pub mod db;
pub mod error;
pub mod handshake;
pub mod session;
pub mod store;

pub use error::{ErrorReason, SessionError};
pub use session::{JwtPayload, Session};
pub use store::SessionStore;

use api::create_api_router;
use auth::{ErrorCallbacks, SessionGate};
use axum::Router;
use backend::SessionBackend;
use db::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerConfig {
    /// Backend session service (SQLite database or in-memory)
    pub backend: Arc<dyn SessionBackend>,
    /// Whether to set Secure flag on cookies (should be true in production with HTTPS)
    pub secure_cookies: bool,
    /// Private error callbacks. `None` uses the process-wide registry.
    pub callbacks: Option<Arc<ErrorCallbacks>>,
}

/// Create the application router with the given configuration.
pub fn create_app(config: &ServerConfig) -> Router {
    let store = Arc::new(SessionStore::new(config.backend.clone()));
    let gate = SessionGate::new(store, config.secure_cookies);
    let gate = match &config.callbacks {
        Some(callbacks) => gate.with_callbacks(callbacks.clone()),
        None => gate,
    };

    create_api_router(gate)
}

/// Run cleanup tasks and spawn background scheduler.
/// Call this before starting the server.
pub async fn init_cleanup(db: &Database) {
    cleanup::run_cleanup(db).await;
    cleanup::spawn_cleanup_scheduler(db.clone());
}

/// Run the server on the given listener. This function blocks until the server exits.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(&config);
    axum::serve(listener, app).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
/// Note: For production use, prefer `run_server` directly in main.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> Result<(tokio::task::JoinHandle<()>, SocketAddr), std::io::Error> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        run_server(config, listener).await.ok();
    });

    Ok((handle, local_addr))
}
