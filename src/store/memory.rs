//! In-memory bundle store for tests and throwaway deployments.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BundleName, BundleStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryBundleStore {
    bundles: RwLock<HashMap<BundleName, Bytes>>,
}

impl MemoryBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.bundles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bundles.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl BundleStore for MemoryBundleStore {
    async fn put(&self, name: &BundleName, bundle: Bytes) -> Result<(), StoreError> {
        self.bundles.write().await.insert(name.clone(), bundle);
        Ok(())
    }

    async fn get(&self, name: &BundleName) -> Result<Bytes, StoreError> {
        self.bundles
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}
