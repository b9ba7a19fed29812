use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::store::BundleName;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Process configuration.  Every field has a default, so an empty document
/// yields the stock deployment (store on `:8888`, assembler publishing
/// `authz.tar.gz` every 10 seconds).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub assembler: AssemblerConfig,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8888`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Persistence backend.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Directory holding one file per bundle (filesystem backend only).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Largest accepted upload body, in bytes.
    #[serde(default = "default_max_bundle_bytes")]
    pub max_bundle_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: StoreBackend::default(),
            root: default_root(),
            max_bundle_bytes: default_max_bundle_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Filesystem,
    Memory,
}

fn default_listen() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("/bundles")
}

fn default_max_bundle_bytes() -> usize {
    64 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssemblerConfig {
    /// Base URL of the bundle store (e.g. `http://bundle-server:8888`).
    #[serde(default = "default_store_url")]
    pub store_url: String,
    /// Name the assembled bundle is published under.
    #[serde(default = "default_bundle_name")]
    pub bundle_name: String,
    /// Pause between the end of one build cycle and the start of the next.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Per-request timeout for uploads to the store.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Ordered archive layout: where each entry lands and which file feeds it.
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            bundle_name: default_bundle_name(),
            interval_secs: default_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            sources: default_sources(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Path of the entry inside the bundle (e.g. `policy/platform.rego`).
    pub archive_path: String,
    /// File read on every cycle to produce the entry.
    pub path: PathBuf,
}

fn default_store_url() -> String {
    "http://bundle-server:8888".to_string()
}

fn default_bundle_name() -> String {
    "authz.tar.gz".to_string()
}

fn default_interval_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_sources() -> Vec<SourceConfig> {
    [
        ("policy/platform.rego", "/app/repo/policies/platform/platform.rego"),
        ("policy/service.rego", "/app/repo/policies/backend/policy.rego"),
        ("data/data.json", "/app/repo/policies/backend/data.json"),
    ]
    .into_iter()
    .map(|(archive_path, path)| SourceConfig {
        archive_path: archive_path.to_string(),
        path: PathBuf::from(path),
    })
    .collect()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse and validate a YAML config document.  An empty document is the
/// default configuration.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents).context("failed to parse YAML")?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let store = &config.store;
    store
        .listen
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("store.listen is not a socket address: {}", store.listen))?;
    anyhow::ensure!(store.max_bundle_bytes > 0, "store.max_bundle_bytes must be positive");

    let asm = &config.assembler;
    let url = reqwest::Url::parse(&asm.store_url)
        .with_context(|| format!("assembler.store_url is not a URL: {}", asm.store_url))?;
    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "assembler.store_url must be http or https"
    );
    BundleName::parse(&asm.bundle_name).context("assembler.bundle_name is not a valid bundle name")?;
    anyhow::ensure!(asm.interval_secs > 0, "assembler.interval_secs must be positive");
    anyhow::ensure!(
        asm.request_timeout_secs > 0,
        "assembler.request_timeout_secs must be positive"
    );
    anyhow::ensure!(!asm.sources.is_empty(), "assembler.sources must not be empty");

    let mut seen = HashSet::new();
    for source in &asm.sources {
        let archive_path = source.archive_path.as_str();
        anyhow::ensure!(
            !archive_path.is_empty()
                && Path::new(archive_path)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_))),
            "archive_path {archive_path:?} must be a relative path without `.` or `..` segments"
        );
        anyhow::ensure!(
            seen.insert(archive_path),
            "archive_path {archive_path:?} is listed more than once"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
