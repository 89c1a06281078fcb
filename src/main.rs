//! SnapVault server binary.
//!
//! Accepts image uploads over multipart HTTP, stores them in an upload
//! directory, records each upload in a JSON metadata file, and serves a
//! JSON listing, an HTML dashboard and the stored files themselves.

mod atomic;
mod auth;
mod background;
mod config;
mod dashboard;
mod error;
mod http;
mod listing;
mod logging;
mod metadata;
mod storage;
mod tls;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::auth::{AuthConfig, StaticKeys};
use crate::background::spawn_background_tasks;
use crate::config::{Args, UPLOADS_URL_PREFIX};
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::metadata::{JsonFileStore, Ledger};
use crate::storage::Storage;

shadow!(build);

/// Starts the SnapVault server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.upload_dir)));
    storage.ensure_root().await?;

    let store = Arc::new(JsonFileStore::new(args.metadata_path()));
    store.check_parent().await?;
    info!(upload_dir = ?storage.root_path(), metadata_file = ?store.path(), "storage ready");
    let ledger = Arc::new(Ledger::new(
        store,
        Duration::from_secs(args.lock_wait_timeout_secs),
    ));

    let keys = StaticKeys::new(args.api_keys.iter().map(|key| key.trim()));
    if keys.is_empty() {
        warn!("no api keys configured, every upload will be rejected");
    } else {
        info!(count = keys.len(), "api keys loaded");
    }
    let auth_config = Arc::new(AuthConfig::new(keys));

    let app = build_router(
        storage.clone(),
        ledger,
        auth_config,
        args.upload_max_size,
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https_addr = SocketAddr::new(host, args.https_port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );
    let https_server = async {
        match tls_config {
            Some(tls_config) => {
                info!("Starting HTTPS server at {}", https_addr);
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            None => std::future::pending::<Result<(), std::io::Error>>().await,
        }
    };

    spawn_background_tasks(storage, Duration::from_secs(args.temp_ttl_secs));
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle.clone()) => {}
    }

    Ok(())
}

/// Builds the application router with every route and shared layer.
fn build_router(
    storage: Arc<Storage>,
    ledger: Arc<Ledger>,
    auth_config: Arc<AuthConfig>,
    upload_max_size: u64,
    cors_origins: Option<&str>,
) -> Router {
    let upload_limit = if upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(upload_max_size).unwrap_or(usize::MAX))
    };

    let mut app = Router::new()
        .route(
            "/api/upload",
            post(upload::upload_image)
                .layer(upload_limit)
                .route_layer(middleware::from_fn(auth::require_api_key)),
        )
        .route("/api/list-uploads", get(listing::list_uploads))
        .route("/dashboard", get(dashboard::dashboard))
        .route("/api/version", get(version::get_version_info))
        .nest_service(UPLOADS_URL_PREFIX, ServeDir::new(storage.root_path()))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(ledger))
        .layer(Extension(auth_config));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
