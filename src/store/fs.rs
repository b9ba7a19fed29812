//! Filesystem-backed bundle store.
//!
//! Bundles live as plain files directly under the storage root:
//! `{root}/{name}`.  Uploads are written to a temporary file in
//! `{root}/.staging` (same filesystem) and renamed over the destination, so a
//! reader never sees a partially-written bundle.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::{BundleName, BundleStore, StoreError};

/// Name of the staging directory inside the storage root.  Hidden names are
/// never accepted by [`BundleName::parse`], so clients cannot address it.
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone)]
pub struct FsBundleStore {
    root: PathBuf,
    staging: PathBuf,
}

impl FsBundleStore {
    /// Open (creating if necessary) a store rooted at `root` and discard any
    /// staging files left behind by an interrupted upload.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(STAGING_DIR);

        tokio::fs::create_dir_all(&staging).await?;

        let mut leftovers = tokio::fs::read_dir(&staging).await?;
        while let Some(entry) = leftovers.next_entry().await? {
            let path = entry.path();
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove stale staging file");
            } else {
                debug!(path = %path.display(), "removed stale staging file");
            }
        }

        Ok(Self { root, staging })
    }

    /// On-disk location of the bundle stored under `name`.
    pub fn entry_path(&self, name: &BundleName) -> PathBuf {
        self.root.join(name.as_str())
    }
}

#[async_trait::async_trait]
impl BundleStore for FsBundleStore {
    #[instrument(skip(self, bundle), fields(bundle = %name, bytes = bundle.len()))]
    async fn put(&self, name: &BundleName, bundle: Bytes) -> Result<(), StoreError> {
        let staging = self.staging.clone();
        let dest = self.entry_path(name);

        tokio::task::spawn_blocking(move || write_atomically(&staging, &dest, &bundle))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        debug!("bundle persisted");
        Ok(())
    }

    #[instrument(skip(self), fields(bundle = %name))]
    async fn get(&self, name: &BundleName) -> Result<Bytes, StoreError> {
        match tokio::fs::read(self.entry_path(name)).await {
            Ok(contents) => Ok(Bytes::from(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn check(&self) -> Result<(), StoreError> {
        let meta = tokio::fs::metadata(&self.staging).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(StoreError::Io(std::io::Error::other(format!(
                "{} is not a directory",
                self.staging.display()
            ))))
        }
    }
}

/// Write `contents` to a fresh temp file in `staging`, fsync it, then rename
/// it over `dest`.  The temp file is removed if anything fails before the
/// rename.
fn write_atomically(staging: &Path, dest: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix("upload-")
        .tempfile_in(staging)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
