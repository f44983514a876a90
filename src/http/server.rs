//! HTTP server implementation.

use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::handlers::{self, AppState};
use crate::error::{GatehouseError, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the application router.
///
/// `/mqtt` triggers a gate; every other path answers the health check.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/mqtt", any(handlers::publish_gate))
        .fallback(handlers::health_check)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP server for the gate service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
    request_timeout: Duration,
    /// How long in-flight requests may run once shutdown starts
    shutdown_timeout: Duration,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            state,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatehouseError::Io(e)
        })?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already-bound listener until `signal` resolves.
    ///
    /// After the signal, in-flight requests get `shutdown_timeout` to finish
    /// before the server returns anyway.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr().unwrap_or(self.addr);
        info!(addr = %local_addr, "Starting HTTP server");

        let app = router(self.state, self.request_timeout)
            .into_make_service_with_connect_info::<SocketAddr>();

        let (draining_tx, draining_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            signal.await;
            let _ = draining_tx.send(());
        })
        .into_future();

        let grace = self.shutdown_timeout;
        let deadline = async move {
            match draining_rx.await {
                Ok(()) => tokio::time::sleep(grace).await,
                Err(_) => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = server => result.map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GatehouseError::Io(e)
            }),
            _ = deadline => {
                warn!(
                    grace_secs = grace.as_secs(),
                    "Graceful shutdown timed out, dropping in-flight requests"
                );
                Ok(())
            }
        }
    }
}
