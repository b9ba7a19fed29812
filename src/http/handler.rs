//! axum router and request handlers for the bundle store.
//!
//! Routes:
//! - `PUT  /bundles/{name}` - Upload (replace) a bundle
//! - `GET  /bundles/{name}` - Download the current bundle
//! - `HEAD /bundles/{name}` - 405, like every other method
//! - `*    /bundles/`       - Always rejected (400, name required)
//! - `GET  /healthz`        - Health check
//! - `GET  /metrics`        - Prometheus metrics
//!
//! The bundle route captures the whole remainder of the path, so names such
//! as `a/b` reach the validator and are refused with `400` rather than
//! falling through to a `404`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use bytes::Bytes;
use tracing::{error, info, instrument, warn};

use super::AppState;
use crate::store::{BundleName, StoreError};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_bundle_bytes;
    Router::new()
        .route(
            "/bundles/{*name}",
            get(handle_fetch)
                .head(handle_head)
                .put(handle_publish)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/bundles", any(handle_missing_name))
        .route("/bundles/", any(handle_missing_name))
        .route("/healthz", get(super::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `PUT /bundles/{name}`
///
/// Validates the name, then atomically replaces whatever was stored under it.
#[instrument(skip(state, body), fields(bytes = body.len()))]
async fn handle_publish(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let size = body.len();
    let result = publish(&state, &name, body).await;
    state.metrics.metrics.record_publish(&result, size);
    let name = result?;

    info!(bundle = %name, bytes = size, "saved bundle");
    Ok((
        StatusCode::OK,
        format!("Bundle uploaded successfully: {name}"),
    )
        .into_response())
}

async fn publish(state: &AppState, raw: &str, body: Bytes) -> Result<BundleName, StoreError> {
    let name = BundleName::parse(raw)?;
    state.store.put(&name, body).await?;
    Ok(name)
}

/// `GET /bundles/{name}`
///
/// Serves the complete current bundle as an attachment.
#[instrument(skip(state))]
async fn handle_fetch(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let result = fetch(&state, &name).await;
    let size = result.as_ref().map_or(0, |(_, bundle)| bundle.len());
    state.metrics.metrics.record_fetch(&result, size);
    let (name, bundle) = result?;

    info!(bundle = %name, bytes = size, "served bundle");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&name)),
        ],
        bundle,
    )
        .into_response())
}

async fn fetch(state: &AppState, raw: &str) -> Result<(BundleName, Bytes), StoreError> {
    let name = BundleName::parse(raw)?;
    let bundle = state.store.get(&name).await?;
    Ok((name, bundle))
}

/// `HEAD /bundles/{name}`: only `GET` and `PUT` are served.
async fn handle_head() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET,PUT")])
}

/// `* /bundles/` with no name at all.
async fn handle_missing_name() -> AppError {
    AppError::Store(StoreError::InvalidName {
        name: String::new(),
        reason: "bundle name is required",
    })
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the store.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// `Content-Disposition` suggesting `name` as the download filename.
///
/// Names that are not plain visible ASCII (or that contain quote characters)
/// get an ASCII fallback plus an RFC 5987 `filename*` parameter.
fn content_disposition(name: &BundleName) -> String {
    let raw = name.as_str();
    let plain = raw
        .bytes()
        .all(|b| b.is_ascii_graphic() || b == b' ')
        && !raw.contains('"');
    if plain {
        return format!("attachment; filename=\"{raw}\"");
    }

    let fallback: String = raw
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(raw.len() * 3);
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// A storage-layer failure for the requested bundle.
    Store(StoreError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Store(StoreError::InvalidName { name, reason }) => {
                warn!(bundle = %name, %reason, "rejected bundle name");
                if name.is_empty() {
                    (StatusCode::BAD_REQUEST, "Bundle name is required").into_response()
                } else {
                    (StatusCode::BAD_REQUEST, "Invalid bundle name").into_response()
                }
            }
            AppError::Store(StoreError::NotFound(name)) => {
                info!(bundle = %name, "bundle not found");
                (StatusCode::NOT_FOUND, format!("Bundle not found: {name}")).into_response()
            }
            AppError::Store(StoreError::Io(err)) => {
                error!(error = %err, "bundle storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err}"),
                )
                    .into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
