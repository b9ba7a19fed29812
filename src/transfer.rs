//! Upload client for the bundle store.
//!
//! Issues `PUT {store_url}/bundles/{name}` with the raw artifact as the body.
//! There is no retry logic here: a failed upload is reported to the caller
//! and the next assembler cycle tries again.

use std::time::Duration;

use anyhow::Context as _;
use axum::http::header;
use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::store::BundleName;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Acknowledgement returned by the store for a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: u16,
    /// First line of the store's confirmation body.
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The request never produced a response (connect, timeout, I/O).
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The store answered with a non-success status.
    #[error("upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Destination for assembled bundles.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, name: &BundleName, artifact: Bytes) -> Result<Ack, TransferError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransferClient {
    http: reqwest::Client,
    store_url: reqwest::Url,
}

impl TransferClient {
    /// Build a client for the store at `store_url` (scheme + authority, e.g.
    /// `http://bundle-server:8888`).
    pub fn new(store_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("bundlehub/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        let store_url = reqwest::Url::parse(store_url)
            .with_context(|| format!("invalid store URL: {store_url}"))?;
        anyhow::ensure!(
            !store_url.cannot_be_a_base(),
            "store URL cannot carry a path: {store_url}"
        );
        Ok(Self { http, store_url })
    }

    /// `{store_url}/bundles/{name}`, with the name percent-encoded as a single
    /// path segment so `#`, `?` and `%` reach the store unchanged.
    pub fn bundle_url(&self, name: &BundleName) -> reqwest::Url {
        let mut url = self.store_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("bundles").push(name.as_str());
        }
        url
    }
}

#[async_trait::async_trait]
impl Publisher for TransferClient {
    #[instrument(skip(self, artifact), fields(bundle = %name, bytes = artifact.len()))]
    async fn publish(&self, name: &BundleName, artifact: Bytes) -> Result<Ack, TransferError> {
        let url = self.bundle_url(name);
        debug!(%url, "uploading bundle");

        let resp = self
            .http
            .put(url)
            .header(header::CONTENT_TYPE, "application/gzip")
            .body(artifact)
            .send()
            .await?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unreadable>"));

        if !status.is_success() {
            warn!(%status, %body, "bundle store rejected upload");
            return Err(TransferError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Ack {
            status: status.as_u16(),
            message: body.lines().next().unwrap_or_default().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
