//! Dispatch web server.
//!
//! Serves the send endpoint, the provider webhooks, message readback and the
//! user views.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch::{router, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        elastic_configured = config.elastic_url.is_some(),
        mandrill_configured = config.mandrill_key.is_some(),
        webhook_signing_configured = config.webhook_auth_key.is_some(),
        signed_webhook_url = %config.signed_webhook_url,
        test_output = %config.test_output.display(),
        "config_loaded"
    );

    let port = config.port;
    let state = AppState::from_config(config).context("Failed to build application state")?;

    if let Err(e) = state.dispatcher.store().ensure_ready().await {
        warn!(error = %e, "store_setup_failed");
    }

    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // The provider checks the callback URL when the webhook is created, so
    // registration runs once the listener is up.
    tokio::spawn(async move {
        match state.register_mandrill_webhook().await {
            Ok(Some(registration)) => {
                info!(created = registration.created, "mandrill_webhook_ready")
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "mandrill_webhook_registration_failed"),
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
