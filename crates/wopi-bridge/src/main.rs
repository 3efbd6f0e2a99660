//! `wopi-bridge` - a WOPI HTTP bridge fronting collaborative editors that
//! don't speak WOPI natively.
//!
//! This is the main entry point: it loads configuration, builds the
//! adapter table, spawns the save coordinator, and serves the HTTP surface.

mod app;
mod config;
mod coordinator;
mod docid;
mod error;
mod handlers;
mod plugins;
mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use app::AppState;
use config::BridgeConfig;
use error::RECOVER_MSG;
use registry::Registry;

const PORT: u16 = 8000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(65);

/// Mirrors the Flask app's generic `errorhandler(Exception)`: any panic
/// escaping a handler is logged and turned into a 500 JSON response instead
/// of tearing down the connection.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "unexpected exception caught in request handler");
    let body = wopi_client::jsonify(&format!("Internal error, please contact support. {RECOVER_MSG}"));
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match BridgeConfig::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "failed to initialize the service, aborting");
            std::process::exit(22);
        }
    };

    let wopi = Arc::new(wopi_client::WopiClient::new(config.outbound_timeout, config.skip_ssl_verify));
    let adapters = Arc::new(plugins::build_adapters(&config, Arc::clone(&wopi)));
    if adapters.is_empty() {
        error!("none of the available app plugins could be initialized, aborting");
        std::process::exit(22);
    }

    let registry = Arc::new(Registry::new());

    let coordinator = coordinator::SaveCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&wopi),
        Arc::clone(&adapters),
        Arc::clone(&config),
    );
    let coordinator_handle = tokio::spawn(coordinator.run());

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        wopi,
        adapters,
        registry: Arc::clone(&registry),
    });

    let app_root = config.app_root.clone();
    let prefixed = Router::new()
        .route("/", get(handlers::index))
        .route("/open", get(handlers::open))
        .route("/save", post(handlers::save))
        .route("/list", get(handlers::list))
        .with_state(Arc::clone(&state));

    let router = Router::new()
        .route("/", get(handlers::redirect_to_root))
        .nest(&app_root, prefixed)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], PORT));

    if config.has_tls_cert() {
        info!(base_url = %app_root, "WOPI Bridge starting in secure mode");
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&config.cert_path, config.key_path())
            .await
            .unwrap_or_else(|e| panic!("unable to load TLS certificate/key: {e}"));

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let shutdown_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("waiting for save coordinator to complete");
            shutdown_registry.shutdown().await;
            shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router.into_make_service())
            .await
            .unwrap_or_else(|e| error!(error = %e, "HTTPS server terminated unexpectedly"));
    } else {
        info!(base_url = %app_root, "WOPI Bridge starting in unsecure/debugging mode");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .unwrap_or_else(|e| panic!("unable to bind {addr}: {e}"));

        let shutdown_registry = Arc::clone(&registry);
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("waiting for save coordinator to complete");
                shutdown_registry.shutdown().await;
            })
            .await
            .unwrap_or_else(|e| error!(error = %e, "HTTP server terminated unexpectedly"));
    }

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, coordinator_handle).await;
}
