//! Name-addressed bundle storage.
//!
//! The HTTP layer talks to storage only through the [`BundleStore`] trait so
//! that the on-disk implementation can be swapped for an in-memory one (tests)
//! or an object store without touching routing.  Every name crosses the
//! [`BundleName`] validator before any backend sees it.

pub mod fs;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};

pub use fs::FsBundleStore;
pub use memory::MemoryBundleStore;

/// Longest accepted bundle name, in bytes (common filename limit).
pub const MAX_NAME_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid bundle name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("bundle not found: {0}")]
    NotFound(String),
    #[error("bundle storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Bundle names
// ---------------------------------------------------------------------------

/// A bundle name that is guaranteed to resolve to a direct child of any
/// storage root it is joined onto.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleName(String);

impl BundleName {
    /// Validate `raw` as a bundle name.
    ///
    /// Rejected: empty names, names containing `..`, `/`, `\`, NUL or any other
    /// ASCII control character, names starting with `.` (which covers `.` and
    /// keeps hidden staging files unreachable), and names longer than
    /// [`MAX_NAME_LEN`] bytes.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let reject = |reason| StoreError::InvalidName {
            name: raw.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(reject("bundle name is required"));
        }
        if raw.len() > MAX_NAME_LEN {
            return Err(reject("bundle name is too long"));
        }
        if raw.contains("..") {
            return Err(reject("parent directory segments are not allowed"));
        }
        if raw.contains(['/', '\\']) {
            return Err(reject("path separators are not allowed"));
        }
        if raw.chars().any(|c| c.is_ascii_control()) {
            return Err(reject("control characters are not allowed"));
        }
        if raw.starts_with('.') {
            return Err(reject("hidden names are reserved"));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Capability interface over the bundle persistence layer.
///
/// Implementations must make `put` atomic with respect to `get`: a concurrent
/// reader observes either the previous complete bundle or the new one, and
/// the last completed `put` for a name wins.
#[async_trait::async_trait]
pub trait BundleStore: Send + Sync {
    /// Store `bundle` under `name`, replacing any previous content.
    async fn put(&self, name: &BundleName, bundle: Bytes) -> Result<(), StoreError>;

    /// Return the current content stored under `name`.
    async fn get(&self, name: &BundleName) -> Result<Bytes, StoreError>;

    /// Verify that the backend is usable.
    async fn check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured [`BundleStore`] backend.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn BundleStore>> {
    match config.backend {
        StoreBackend::Filesystem => {
            let store = FsBundleStore::open(&config.root)
                .await
                .with_context(|| format!("failed to open bundle root: {}", config.root.display()))?;
            info!(root = %config.root.display(), "filesystem bundle store ready");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("in-memory bundle store ready; bundles will not survive restarts");
            Ok(Arc::new(MemoryBundleStore::new()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::{Component, Path};

    use proptest::prelude::*;

    use super::*;

    fn is_invalid(raw: &str) -> bool {
        matches!(
            BundleName::parse(raw),
            Err(StoreError::InvalidName { .. })
        )
    }

    #[test]
    fn accepts_ordinary_names() {
        for ok in ["authz.tar.gz", "bundle", "a.b.c", "team-x_v2.tgz", "ümlaut.tar.gz"] {
            assert_eq!(BundleName::parse(ok).unwrap().as_str(), ok);
        }
    }

    #[test]
    fn rejects_empty_traversal_and_separators() {
        for bad in ["", "../secret", "a/b", "..", ".", "/etc/passwd", "a\\b", "..\\x", "x.."] {
            assert!(is_invalid(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_control_characters_and_hidden_names() {
        assert!(is_invalid("a\0b"));
        assert!(is_invalid("line\nbreak"));
        assert!(is_invalid(".staging"));
        assert!(is_invalid(".hidden.tar.gz"));
    }

    #[test]
    fn rejects_overlong_names() {
        assert!(!is_invalid(&"a".repeat(MAX_NAME_LEN)));
        assert!(is_invalid(&"a".repeat(MAX_NAME_LEN + 1)));
    }

    fn assert_direct_child(raw: &str) {
        let root = Path::new("/srv/bundles");
        if let Ok(name) = BundleName::parse(raw) {
            let resolved = root.join(name.as_str());
            assert_eq!(resolved.parent(), Some(root), "{raw:?} escaped the root");
            let tail: Vec<_> = resolved.strip_prefix(root).unwrap().components().collect();
            assert_eq!(tail.len(), 1, "{raw:?} resolved to {}", resolved.display());
            assert!(matches!(tail[0], Component::Normal(_)), "{raw:?}");
        }
    }

    proptest! {
        #[test]
        fn accepted_names_stay_directly_under_root(raw in any::<String>()) {
            assert_direct_child(&raw);
        }

        #[test]
        fn accepted_path_like_names_stay_directly_under_root(
            raw in "[./\\\\a-z~:\\x00 ]{0,16}"
        ) {
            assert_direct_child(&raw);
        }
    }
}
