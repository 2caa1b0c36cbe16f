use clap::Parser;
use sessiongate::auth::ErrorCallbacks;
use sessiongate::cli::{
    Args, backend_settings, build_config, init_logging, install_harness_callbacks,
    load_signing_secret, open_database, validate_origin,
};
use sessiongate::{create_app, init_cleanup};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_format);

    let Some(signing_secret) = load_signing_secret(args.signing_secret_file.as_deref()) else {
        std::process::exit(1);
    };

    let Some(origin) = validate_origin(&args.origin) else {
        std::process::exit(1);
    };

    let settings = backend_settings(&args, signing_secret);
    let Some(db) = open_database(&args.database, settings).await else {
        std::process::exit(1);
    };

    init_cleanup(&db).await;
    install_harness_callbacks(ErrorCallbacks::global());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            error!(address = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        });

    let local_addr = match listener.local_addr() {
        Ok(local_addr) => local_addr,
        Err(e) => {
            error!(error = %e, "Failed to read local address");
            std::process::exit(1);
        }
    };

    let config = build_config(db, &origin);
    let app = create_app(&config);

    info!(address = %local_addr, "Listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
