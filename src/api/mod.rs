//! Gateway HTTP Surface
//!
//! Axum router serving the WebSocket endpoints and health probes.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET <base>/devices` - Directory mode (device listing + heartbeats)
//! - `GET <base>/devices/{device_id}` - Live updates and commands for one device
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use devgate::api::{serve, AppState};
//! use tokio_util::sync::CancellationToken;
//!
//! let state = AppState::new(config, factory, provisioner, directory, commands);
//! let cancel = CancellationToken::new();
//! let tasks = state.spawn_background(cancel.clone());
//! serve(state.clone()).await?;
//! cancel.cancel();
//! state.shutdown().await;
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::websocket::{device_handler, directory_handler};

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let base = state.config.gateway.base_path.trim_end_matches('/').to_string();

    let ws_routes = Router::new()
        .route(&format!("{}/devices", base), get(directory_handler))
        .route(&format!("{}/devices/", base), get(directory_handler))
        .route(&format!("{}/devices/:device_id", base), get(device_handler));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let shared_state = Arc::new(state);

    Router::new()
        .merge(ws_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Bind the configured address and serve until Ctrl-C / SIGTERM
pub async fn serve(state: AppState) -> Result<(), ApiError> {
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ApiError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!("devgate listening on {}", addr);
    serve_on(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve_on<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ApiError::Server(e.to_string()))?;

    tracing::info!("devgate HTTP server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
