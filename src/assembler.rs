//! Periodic bundle assembler.
//!
//! Each cycle walks `Idle → ReadingInputs → Encoding → Publishing → Idle`:
//!
//! 1. Read every configured input source from disk, fresh.
//! 2. Package the contents into a `.tar.gz` using the configured archive
//!    layout, in order.
//! 3. Upload the artifact to the bundle store under the configured name.
//!
//! A failed cycle is logged and abandoned; the loop sleeps for the configured
//! interval (measured from the end of the cycle) and tries again.  There is no
//! backoff and no limit on consecutive failures.  Cycles never overlap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::archive::{self, ArchiveEntry, ArchiveError};
use crate::config::AssemblerConfig;
use crate::store::BundleName;
use crate::transfer::{Ack, Publisher, TransferClient, TransferError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A file whose current bytes become one entry of every bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    /// Where the content lands inside the archive.
    pub archive_path: String,
    /// Where the content is read from.
    pub path: PathBuf,
}

impl InputSource {
    pub fn new(archive_path: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            path: path.into(),
        }
    }
}

/// Phase of a build cycle in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReadingInputs,
    Encoding,
    Publishing,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("input source not found: {}", path.display())]
    MissingInput { path: PathBuf },
    #[error("failed to read input source {}: {source}", path.display())]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode bundle: {0}")]
    Encoding(#[from] ArchiveError),
    #[error("failed to publish bundle: {0}")]
    Transfer(#[from] TransferError),
}

impl BuildError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::MissingInput { .. } | Self::ReadInput { .. } => Stage::ReadingInputs,
            Self::Encoding(_) => Stage::Encoding,
            Self::Transfer(_) => Stage::Publishing,
        }
    }
}

/// Summary of a successful build cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub bundle: BundleName,
    /// `(archive_path, size)` for every entry, in archive order.
    pub entries: Vec<(String, usize)>,
    pub artifact_bytes: usize,
    pub ack: Ack,
    pub elapsed: Duration,
}

/// Running tally of cycle outcomes, kept by [`Assembler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub succeeded: u64,
    pub failed: u64,
    pub consecutive_failures: u64,
}

impl CycleStats {
    fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
            self.consecutive_failures = 0;
        } else {
            self.failed += 1;
            self.consecutive_failures += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

pub struct Assembler {
    sources: Vec<InputSource>,
    bundle_name: BundleName,
    publisher: Arc<dyn Publisher>,
    interval: Duration,
}

impl Assembler {
    /// Create an assembler that packages `sources` (in order) and publishes
    /// the result as `bundle_name` every `interval`.
    pub fn new(
        sources: Vec<InputSource>,
        bundle_name: BundleName,
        publisher: Arc<dyn Publisher>,
        interval: Duration,
    ) -> Self {
        Self {
            sources,
            bundle_name,
            publisher,
            interval,
        }
    }

    /// Build an assembler that uploads over HTTP as described by `config`.
    pub fn from_config(config: &AssemblerConfig) -> anyhow::Result<Self> {
        let bundle_name =
            BundleName::parse(&config.bundle_name).context("invalid assembler.bundle_name")?;
        let client = TransferClient::new(
            &config.store_url,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let sources = config
            .sources
            .iter()
            .map(|s| InputSource::new(s.archive_path.clone(), s.path.clone()))
            .collect();
        Ok(Self::new(
            sources,
            bundle_name,
            Arc::new(client),
            Duration::from_secs(config.interval_secs),
        ))
    }

    pub fn sources(&self) -> &[InputSource] {
        &self.sources
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run build cycles until `cancel` fires.
    ///
    /// Cancellation is honoured between cycles (including during the sleep);
    /// an in-flight cycle always runs to completion.
    pub async fn run(&self, cancel: CancellationToken) -> CycleStats {
        info!(
            bundle = %self.bundle_name,
            interval_secs = self.interval.as_secs_f64(),
            sources = self.sources.len(),
            "bundle assembler started"
        );

        let mut stats = CycleStats::default();

        while !cancel.is_cancelled() {
            let result = self.build_once().await;
            stats.record(result.is_ok());

            match result {
                Ok(report) => info!(
                    bundle = %report.bundle,
                    entries = ?report.entries,
                    bytes = report.artifact_bytes,
                    response = %report.ack.message,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "bundle build complete"
                ),
                Err(e) => error!(
                    error = %e,
                    stage = ?e.stage(),
                    consecutive_failures = stats.consecutive_failures,
                    "bundle build failed; retrying next interval"
                ),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            "bundle assembler stopped"
        );
        stats
    }

    /// Run a single read → encode → publish cycle.
    #[instrument(skip(self), fields(bundle = %self.bundle_name))]
    pub async fn build_once(&self) -> Result<CycleReport, BuildError> {
        let started = Instant::now();
        debug!("starting bundle build");

        let entries = self.read_inputs().await?;
        let sizes = entries
            .iter()
            .map(|e| (e.path.clone(), e.data.len()))
            .collect();

        let artifact = Bytes::from(archive::encode(&entries)?);
        drop(entries);
        let artifact_bytes = artifact.len();
        debug!(bytes = artifact_bytes, "bundle packaged");

        let ack = self.publisher.publish(&self.bundle_name, artifact).await?;

        Ok(CycleReport {
            bundle: self.bundle_name.clone(),
            entries: sizes,
            artifact_bytes,
            ack,
            elapsed: started.elapsed(),
        })
    }

    async fn read_inputs(&self) -> Result<Vec<ArchiveEntry>, BuildError> {
        let mut entries = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let data = tokio::fs::read(&source.path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BuildError::MissingInput {
                        path: source.path.clone(),
                    }
                } else {
                    BuildError::ReadInput {
                        path: source.path.clone(),
                        source: e,
                    }
                }
            })?;
            debug!(
                archive_path = %source.archive_path,
                path = %source.path.display(),
                bytes = data.len(),
                "read input source"
            );
            entries.push(ArchiveEntry::new(source.archive_path.clone(), data));
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::http::testing::spawn_store;
    use crate::store::{BundleStore, MemoryBundleStore};

    /// Publisher that records every artifact and can be told to fail.
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(BundleName, Bytes)>>,
        fail: AtomicBool,
        notify: Option<mpsc::UnboundedSender<()>>,
    }

    #[async_trait::async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, name: &BundleName, artifact: Bytes) -> Result<Ack, TransferError> {
            if let Some(tx) = &self.notify {
                let _ = tx.send(());
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransferError::Rejected {
                    status: 500,
                    body: "Internal server error: disk full".into(),
                });
            }
            self.published
                .lock()
                .unwrap()
                .push((name.clone(), artifact));
            Ok(Ack {
                status: 200,
                message: format!("Bundle uploaded successfully: {name}"),
            })
        }
    }

    /// The stock three-file policy repository layout.
    fn write_repo(dir: &Path, platform: &[u8], service: &[u8], data: &[u8]) -> Vec<InputSource> {
        std::fs::create_dir_all(dir.join("platform")).unwrap();
        std::fs::create_dir_all(dir.join("backend")).unwrap();
        std::fs::write(dir.join("platform/platform.rego"), platform).unwrap();
        std::fs::write(dir.join("backend/policy.rego"), service).unwrap();
        std::fs::write(dir.join("backend/data.json"), data).unwrap();
        vec![
            InputSource::new("policy/platform.rego", dir.join("platform/platform.rego")),
            InputSource::new("policy/service.rego", dir.join("backend/policy.rego")),
            InputSource::new("data/data.json", dir.join("backend/data.json")),
        ]
    }

    fn bundle_name() -> BundleName {
        BundleName::parse("authz.tar.gz").unwrap()
    }

    fn assembler(sources: Vec<InputSource>, publisher: Arc<dyn Publisher>) -> Assembler {
        Assembler::new(sources, bundle_name(), publisher, Duration::from_millis(20))
    }

    // ── single cycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn cycle_packages_sources_in_layout_order() {
        let tmp = tempfile::tempdir().unwrap();
        let sources = write_repo(tmp.path(), b"package platform", b"", b"{\"rollout_percentage\":5}");
        let publisher = Arc::new(RecordingPublisher::default());
        let asm = assembler(sources, publisher.clone());

        let report = asm.build_once().await.unwrap();
        assert_eq!(report.bundle, bundle_name());
        assert_eq!(
            report.entries,
            vec![
                ("policy/platform.rego".to_string(), 16),
                ("policy/service.rego".to_string(), 0),
                ("data/data.json".to_string(), 24),
            ]
        );

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, bundle_name());
        assert_eq!(published[0].1.len(), report.artifact_bytes);

        let decoded = archive::decode(&published[0].1).unwrap();
        assert_eq!(
            decoded,
            vec![
                ArchiveEntry::new("policy/platform.rego", b"package platform".to_vec()),
                ArchiveEntry::new("policy/service.rego", Vec::new()),
                ArchiveEntry::new("data/data.json", b"{\"rollout_percentage\":5}".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn custom_layout_is_honoured() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("only.rego"), b"package only").unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let asm = assembler(
            vec![InputSource::new("rules/only.rego", tmp.path().join("only.rego"))],
            publisher.clone(),
        );

        asm.build_once().await.unwrap();
        let published = publisher.published.lock().unwrap();
        let decoded = archive::decode(&published[0].1).unwrap();
        assert_eq!(
            decoded,
            vec![ArchiveEntry::new("rules/only.rego", b"package only".to_vec())]
        );
    }

    #[tokio::test]
    async fn missing_input_fails_cycle_without_publishing() {
        let tmp = tempfile::tempdir().unwrap();
        let sources = write_repo(tmp.path(), b"p", b"s", b"{}");
        std::fs::remove_file(tmp.path().join("backend/data.json")).unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let asm = assembler(sources, publisher.clone());

        let err = asm.build_once().await.unwrap_err();
        assert!(
            matches!(&err, BuildError::MissingInput { path } if path.ends_with("backend/data.json"))
        );
        assert_eq!(err.stage(), Stage::ReadingInputs);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_input_is_distinguished_from_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sources = write_repo(tmp.path(), b"p", b"s", b"{}");
        // A directory exists but cannot be read as a file.
        sources[1].path = tmp.path().join("backend");
        let asm = assembler(sources, Arc::new(RecordingPublisher::default()));

        let err = asm.build_once().await.unwrap_err();
        assert!(matches!(err, BuildError::ReadInput { .. }), "{err}");
    }

    #[tokio::test]
    async fn invalid_layout_is_an_encoding_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), b"x").unwrap();
        let asm = assembler(
            vec![InputSource::new("../escape", tmp.path().join("f"))],
            Arc::new(RecordingPublisher::default()),
        );

        let err = asm.build_once().await.unwrap_err();
        assert_eq!(err.stage(), Stage::Encoding);
    }

    #[tokio::test]
    async fn rejected_upload_is_a_transfer_error() {
        let tmp = tempfile::tempdir().unwrap();
        let sources = write_repo(tmp.path(), b"p", b"s", b"{}");
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.fail.store(true, Ordering::SeqCst);
        let asm = assembler(sources, publisher);

        let err = asm.build_once().await.unwrap_err();
        assert!(matches!(
            err,
            BuildError::Transfer(TransferError::Rejected { status: 500, .. })
        ));
        assert_eq!(err.stage(), Stage::Publishing);
    }

    // ── against a real store ───────────────────────────────────────────

    #[tokio::test]
    async fn failed_cycle_leaves_store_untouched_and_next_cycle_recovers() {
        let store = Arc::new(MemoryBundleStore::new());
        let base = spawn_store(store.clone(), 1024 * 1024).await;
        let client = TransferClient::new(&base, Duration::from_secs(5)).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let sources = write_repo(tmp.path(), b"package platform", b"package service", b"{\"v\":1}");
        let asm = assembler(sources, Arc::new(client));

        asm.build_once().await.unwrap();
        let first = store.get(&bundle_name()).await.unwrap();

        // The canary file disappears mid-deployment.
        let data_path = tmp.path().join("backend/data.json");
        std::fs::remove_file(&data_path).unwrap();
        let err = asm.build_once().await.unwrap_err();
        assert!(matches!(err, BuildError::MissingInput { .. }));
        assert_eq!(store.get(&bundle_name()).await.unwrap(), first);

        // Restored with new content: the next cycle publishes it.
        std::fs::write(&data_path, b"{\"v\":2}").unwrap();
        let report = asm.build_once().await.unwrap();
        assert_eq!(report.ack.status, 200);

        let second = store.get(&bundle_name()).await.unwrap();
        assert_ne!(second, first);
        let decoded = archive::decode(&second).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].data, b"package platform");
        assert_eq!(decoded[1].data, b"package service");
        assert_eq!(decoded[2].data, b"{\"v\":2}");
    }

    // ── loop ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn loop_keeps_going_after_failures_and_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let sources = write_repo(tmp.path(), b"p", b"s", b"{}");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(RecordingPublisher {
            notify: Some(tx),
            ..Default::default()
        });
        publisher.fail.store(true, Ordering::SeqCst);

        let asm = Arc::new(assembler(sources, publisher.clone()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let asm = Arc::clone(&asm);
            let cancel = cancel.clone();
            async move { asm.run(cancel).await }
        });

        // Three failing cycles in a row, then let it succeed.
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        publisher.fail.store(false, Ordering::SeqCst);
        while publisher.published.lock().unwrap().is_empty() {
            rx.recv().await.unwrap();
        }

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("assembler did not stop")
            .unwrap();

        assert!(stats.failed >= 3);
        assert!(stats.succeeded >= 1);
        assert_eq!(stats.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_no_cycles() {
        let publisher = Arc::new(RecordingPublisher::default());
        let asm = assembler(Vec::new(), publisher.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = asm.run(cancel).await;
        assert_eq!(stats, CycleStats::default());
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_interrupts_the_sleep() {
        let tmp = tempfile::tempdir().unwrap();
        let sources = write_repo(tmp.path(), b"p", b"s", b"{}");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(RecordingPublisher {
            notify: Some(tx),
            ..Default::default()
        });
        let asm = Arc::new(Assembler::new(
            sources,
            bundle_name(),
            publisher,
            Duration::from_secs(3600),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let asm = Arc::clone(&asm);
            let cancel = cancel.clone();
            async move { asm.run(cancel).await }
        });

        rx.recv().await.unwrap();
        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sleep was not interrupted")
            .unwrap();
        assert_eq!(stats.succeeded, 1);
    }

    #[test]
    fn from_config_uses_configured_layout() {
        let config = AssemblerConfig::default();
        let asm = Assembler::from_config(&config).unwrap();
        assert_eq!(asm.interval(), Duration::from_secs(10));
        assert_eq!(asm.sources().len(), 3);
        assert_eq!(asm.sources()[2].archive_path, "data/data.json");
    }
}
