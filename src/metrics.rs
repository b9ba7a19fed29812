use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Ok,
    InvalidName,
    NotFound,
    Error,
}

impl Outcome {
    pub fn of<T>(result: &Result<T, StoreError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(StoreError::InvalidName { .. }) => Self::InvalidName,
            Err(StoreError::NotFound(_)) => Self::NotFound,
            Err(StoreError::Io(_)) => Self::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the bundle store.
pub struct Metrics {
    pub publish_total: Family<OutcomeLabels, Counter>,
    pub fetch_total: Family<OutcomeLabels, Counter>,
    pub published_bytes: Counter,
    pub served_bytes: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let publish_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "bundlehub_publish",
            "Bundle uploads by outcome",
            publish_total.clone(),
        );

        let fetch_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "bundlehub_fetch",
            "Bundle downloads by outcome",
            fetch_total.clone(),
        );

        let published_bytes = Counter::default();
        registry.register(
            "bundlehub_published_bytes",
            "Bytes accepted through successful uploads",
            published_bytes.clone(),
        );

        let served_bytes = Counter::default();
        registry.register(
            "bundlehub_served_bytes",
            "Bytes returned by successful downloads",
            served_bytes.clone(),
        );

        Self {
            publish_total,
            fetch_total,
            published_bytes,
            served_bytes,
        }
    }

    pub fn record_publish<T>(&self, result: &Result<T, StoreError>, bytes: usize) {
        let outcome = Outcome::of(result);
        self.publish_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
        if outcome == Outcome::Ok {
            self.published_bytes.inc_by(bytes as u64);
        }
    }

    pub fn record_fetch<T>(&self, result: &Result<T, StoreError>, bytes: usize) {
        let outcome = Outcome::of(result);
        self.fetch_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
        if outcome == Outcome::Ok {
            self.served_bytes.inc_by(bytes as u64);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::http::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all store metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
