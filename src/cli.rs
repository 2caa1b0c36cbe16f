//! CLI argument parsing, validation, and startup helpers.

use crate::ServerConfig;
use crate::auth::ErrorCallbacks;
use crate::backend::BackendSettings;
use crate::db::Database;
use crate::handshake::SameSite;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use url::Url;

const MIN_SIGNING_SECRET_LENGTH: usize = 32;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sessiongate",
    about = "Session authentication server with rotating refresh tokens"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080", env = "SESSIONGATE_PORT")]
    pub port: u16,

    /// Path to SQLite database file (":memory:" for a throwaway database)
    #[arg(short, long, default_value = "sessiongate.db", env = "SESSIONGATE_DATABASE")]
    pub database: String,

    /// Public origin of the server. An https origin enables Secure cookies
    #[arg(long, default_value = "http://localhost:8080")]
    pub origin: String,

    /// Path to file containing the token signing secret.
    /// Prefer using SIGNING_SECRET env var instead
    #[arg(long)]
    pub signing_secret_file: Option<String>,

    /// Version label of the signing key, carried in every token header
    #[arg(long, default_value = BackendSettings::DEFAULT_KEY_ID)]
    pub key_id: String,

    /// Access token lifetime in seconds
    #[arg(long, default_value = "3600")]
    pub access_token_validity: u64,

    /// Refresh token (and session) lifetime in seconds
    #[arg(long, default_value = "8640000")]
    pub refresh_token_validity: u64,

    /// Domain attribute of session cookies
    #[arg(long)]
    pub cookie_domain: Option<String>,

    /// SameSite attribute of session cookies: strict, lax or none
    #[arg(long, default_value = "lax")]
    pub cookie_same_site: SameSite,

    /// Cookie path of the refresh token
    #[arg(long, default_value = "/")]
    pub refresh_token_path: String,

    /// Require an anti-CSRF token on state-changing requests
    #[arg(long)]
    pub anti_csrf: bool,

    /// Trust access tokens until they expire instead of asking the backend on every request
    #[arg(long)]
    pub no_blacklisting: bool,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load the signing secret from environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_signing_secret(signing_secret_file: Option<&str>) -> Option<Vec<u8>> {
    let secret = if let Ok(secret) = std::env::var("SIGNING_SECRET") {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var("SIGNING_SECRET") };
        secret
    } else if let Some(path) = signing_secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read signing secret file");
                return None;
            }
        }
    } else {
        error!(
            "Signing secret is required. Set SIGNING_SECRET environment variable (recommended) or use --signing-secret-file"
        );
        return None;
    };

    if secret.len() < MIN_SIGNING_SECRET_LENGTH {
        error!(
            "Signing secret is shorter than {} characters. Use a longer secret",
            MIN_SIGNING_SECRET_LENGTH
        );
        return None;
    }

    Some(secret.into_bytes())
}

/// Parse and validate the origin URL.
/// Returns None and logs an error if validation fails.
pub fn validate_origin(origin: &str) -> Option<Url> {
    let url = match Url::parse(origin) {
        Ok(url) => url,
        Err(e) => {
            error!(origin = %origin, error = %e, "Invalid origin URL");
            return None;
        }
    };

    let is_https = url.scheme() == "https";
    let is_localhost = url.host_str() == Some("localhost");

    if !is_https && !is_localhost {
        error!("origin must use HTTPS for non-localhost deployments");
        return None;
    }

    Some(url)
}

/// Token policy from validated arguments.
pub fn backend_settings(args: &Args, signing_secret: Vec<u8>) -> BackendSettings {
    let mut settings = BackendSettings::new(Vec::new())
        .with_signing_key(args.key_id.clone(), signing_secret)
        .with_access_token_validity(Duration::from_secs(args.access_token_validity))
        .with_refresh_token_validity(Duration::from_secs(args.refresh_token_validity))
        .with_anti_csrf(args.anti_csrf)
        .with_access_token_blacklisting(!args.no_blacklisting);
    settings.cookie_domain = args.cookie_domain.clone();
    settings.cookie_same_site = args.cookie_same_site;
    settings.refresh_token_path = args.refresh_token_path.clone();
    settings
}

/// Build ServerConfig from validated arguments.
pub fn build_config(db: Database, origin: &Url) -> ServerConfig {
    ServerConfig {
        backend: Arc::new(db),
        secure_cookies: origin.scheme() == "https",
        callbacks: None,
    }
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str, settings: BackendSettings) -> Option<Database> {
    match Database::open(path, settings).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}

/// Responses expected by the browser client test suites: empty 401 bodies
/// and a plain-text 500.
pub fn install_harness_callbacks(callbacks: &ErrorCallbacks) {
    fn empty_unauthorized(_: &crate::error::SessionError) -> Response {
        StatusCode::UNAUTHORIZED.into_response()
    }

    callbacks.on_refresh_required(empty_unauthorized);
    callbacks.on_unauthorized(empty_unauthorized);
    callbacks.on_general_error(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong").into_response()
    });
}
