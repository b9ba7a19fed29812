//! HTTP layer of the bundle store.
//!
//! This module provides the axum-based server through which the assembler
//! publishes bundles (`PUT /bundles/{name}`) and consumers fetch them
//! (`GET /bundles/{name}`), plus health and Prometheus endpoints.

pub mod handler;
pub mod health;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::metrics::MetricsRegistry;
use crate::store::BundleStore;

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BundleStore>,
    pub metrics: MetricsRegistry,
    /// Largest accepted upload body, in bytes.
    pub max_bundle_bytes: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn BundleStore>, max_bundle_bytes: usize) -> Self {
        Self {
            store,
            metrics: MetricsRegistry::new(),
            max_bundle_bytes,
        }
    }
}

/// Bind `listen` and serve the store until `shutdown` resolves.
pub async fn run_http_server(
    listen: &str,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listen_addr: SocketAddr = listen.parse().context("invalid listen address")?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "bundle store listening");
    serve(listener, state, shutdown).await
}

/// Serve the store on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = handler::create_router(Arc::new(state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Start a store server on an ephemeral loopback port and return its base
    /// URL.  The server lives until the test runtime shuts down.
    pub async fn spawn_store(store: Arc<dyn BundleStore>, max_bundle_bytes: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(store, max_bundle_bytes);
        tokio::spawn(serve(listener, state, std::future::pending()));
        format!("http://{addr}")
    }
}
