//! Server lifecycle management
//!
//! Serves the signaling websocket and the health endpoint, then tears the
//! SFU down on SIGINT/SIGTERM.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use relay_sfu::{SfuManager, SignalingDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::websocket::signaling_handler;

/// How long in-flight HTTP connections get to finish after the SFU is down
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
    pub dispatcher: SignalingDispatcher,
    pub outbound_buffer: usize,
}

/// Build the HTTP router
pub fn create_router(config: &Config, manager: Arc<SfuManager>) -> Router {
    let state = AppState {
        dispatcher: SignalingDispatcher::new(Arc::clone(&manager)),
        outbound_buffer: config.sfu.notification_buffer.max(1),
        manager,
    };

    Router::new()
        .route(&config.signal_route(), get(signaling_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.manager.stats();
    let status = if stats.engine_available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(stats))
}

/// Relay server - owns the HTTP listener and the SFU manager
pub struct RelayServer {
    config: Config,
    manager: Arc<SfuManager>,
}

impl RelayServer {
    #[must_use]
    pub const fn new(config: Config, manager: Arc<SfuManager>) -> Self {
        Self { config, manager }
    }

    /// Start serving and wait for shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!(
            "Signaling server listening on ws://{}{}",
            listener.local_addr()?,
            self.config.signal_route()
        );

        let router = create_router(&self.config, Arc::clone(&self.manager));
        let http_handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        shutdown_signal().await;
        info!("Shutting down...");

        let _ = shutdown_tx.send(true);
        // Cancels every session so open websockets wind down
        self.manager.shutdown().await;

        if tokio::time::timeout(HTTP_DRAIN_TIMEOUT, http_handle).await.is_err() {
            warn!("HTTP server did not drain within {:?}", HTTP_DRAIN_TIMEOUT);
        }

        info!("Relay server stopped");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use relay_sfu::MemoryEngine;
    use tower::ServiceExt;

    async fn health(manager: Arc<SfuManager>) -> (StatusCode, serde_json::Value) {
        let router = create_router(&Config::default(), manager);
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_engine_state() {
        let manager = SfuManager::new(Config::default().sfu);
        let (status, body) = health(Arc::clone(&manager)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["engine_available"], false);

        manager.attach_engine(Arc::new(MemoryEngine::new(20000, 29999)));
        let (status, body) = health(manager).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_rooms"], 0);
    }

    #[tokio::test]
    async fn test_signal_route_requires_upgrade() {
        let manager = SfuManager::new(Config::default().sfu);
        let router = create_router(&Config::default(), manager);
        let response = router
            .oneshot(Request::builder().uri("/signal/lobby").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
