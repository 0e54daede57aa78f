//! Bulk uploader.
//!
//! Runs on its own task and timer, independent of the connector. Each tick
//! walks the spill root, uploads every finished file to
//! `{prefix}/{relative path}` and deletes the local copy only after the
//! store acknowledged the put. A failed file stays where it is and is
//! picked up again on the next tick.
//!
//! The uploader never touches the in-memory buffer; the spill directory is
//! the only thing it shares with the ingestion side.

use crate::config::UploadConfig;
use crate::pipeline::is_in_progress;
use crate::storage::remote_key;
use crate::{Error, Result};
use metrics::{counter, gauge};
use object_store::{ObjectStore, PutPayload};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Outcome of one upload tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Files found on disk.
    pub scanned: usize,
    /// Files uploaded and deleted locally.
    pub uploaded: usize,
    /// Files that failed and were left in place.
    pub failed: usize,
    /// Bytes uploaded.
    pub bytes: u64,
}

impl UploadReport {
    fn absorb(&mut self, other: &UploadReport) {
        self.scanned += other.scanned;
        self.uploaded += other.uploaded;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

/// Totals over the lifetime of [`BulkUploader::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadTotals {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub files: UploadReport,
}

/// Moves spill files to the object store.
pub struct BulkUploader {
    store: Arc<dyn ObjectStore>,
    root: PathBuf,
    prefix: String,
    interval: Duration,
}

impl BulkUploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            root: root.into(),
            prefix: prefix.into(),
            interval,
        }
    }

    /// Uploader for `root` with the prefix and interval from `config`.
    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        root: impl Into<PathBuf>,
        config: &UploadConfig,
    ) -> Self {
        Self::new(store, root, config.prefix.as_str(), config.interval())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// List finished spill files under the root (blocking pool).
    pub async fn scan(&self) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_spill_files(&root)).await?
    }

    /// One tick: upload everything currently on disk.
    ///
    /// Per-file failures are logged and counted, never returned. Only a
    /// failure to scan the directory at all is an error.
    pub async fn run_once(&self) -> Result<UploadReport> {
        let files = self.scan().await?;
        let mut report = UploadReport {
            scanned: files.len(),
            ..Default::default()
        };
        gauge!("upload_pending_files").set(files.len() as f64);

        if files.is_empty() {
            debug!("No spill files to upload");
            return Ok(report);
        }

        info!("Uploading {} spill file(s)", files.len());
        for path in &files {
            match self.upload_file(path).await {
                Ok(bytes) => {
                    report.uploaded += 1;
                    report.bytes += bytes;
                    counter!("upload_files_total").increment(1);
                    counter!("upload_bytes_total").increment(bytes);
                }
                Err(e) => {
                    report.failed += 1;
                    counter!("upload_failures_total").increment(1);
                    error!("Failed to upload {}: {}", path.display(), e);
                }
            }
        }

        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || prune_empty_dirs(&root)).await {
            Ok(Ok(removed)) if removed > 0 => debug!("Pruned {} empty partition dir(s)", removed),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to prune spill directories: {}", e),
            Err(e) => warn!("Prune task failed: {}", e),
        }

        info!(
            "Upload tick done: {} uploaded ({} bytes), {} failed",
            report.uploaded, report.bytes, report.failed
        );
        Ok(report)
    }

    async fn upload_file(&self, path: &Path) -> Result<u64> {
        let relative = path.strip_prefix(&self.root).map_err(|_| {
            Error::Spill(format!(
                "{} is outside the spill root {}",
                path.display(),
                self.root.display()
            ))
        })?;
        let key = remote_key(&self.prefix, relative)?;

        let data = tokio::fs::read(path).await?;
        let bytes = data.len() as u64;

        self.store.put(&key, PutPayload::from(data)).await?;
        tokio::fs::remove_file(path).await?;

        debug!("Uploaded {} to {} and deleted it locally", path.display(), key);
        Ok(bytes)
    }

    /// Tick every `interval` (first tick immediately) until cancelled.
    ///
    /// Cancellation is checked between ticks; a tick in progress finishes.
    pub async fn run(&self, cancel: CancellationToken) -> UploadTotals {
        info!(
            "Bulk uploader started: root={}, prefix={}, interval={}s",
            self.root.display(),
            self.prefix,
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut totals = UploadTotals::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            totals.ticks += 1;
            counter!("upload_ticks_total").increment(1);
            match self.run_once().await {
                Ok(report) => totals.files.absorb(&report),
                Err(e) => {
                    totals.failed_ticks += 1;
                    error!("Upload tick failed: {}", e);
                }
            }
        }

        info!(
            "Bulk uploader stopped after {} tick(s): {} uploaded, {} failed",
            totals.ticks, totals.files.uploaded, totals.files.failed
        );
        totals
    }
}

/// Finished spill files under `root`, sorted. A missing root is empty.
pub fn scan_spill_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && !is_in_progress(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Remove empty directories below `root` (never `root` itself).
fn prune_empty_dirs(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if fs::read_dir(entry.path())?.next().is_none() {
            // A writer may have just created it; losing that race only
            // means the writer recreates it.
            if fs::remove_dir(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &[u8]) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    async fn remote(store: &InMemory, key: &str) -> Vec<u8> {
        store
            .get(&ObjectPath::from(key))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_run_once_uploads_and_deletes() {
        let spill = TempDir::new().unwrap();
        write(spill.path(), "data_1-000000.parquet", b"flat");
        write(spill.path(), "tag=go/hashtag_data_a_1-000001.parquet", b"go");
        write(spill.path(), "tag=rust/hashtag_data_b_1-000001.parquet", b"rust");

        let store = Arc::new(InMemory::new());
        let uploader = BulkUploader::new(
            store.clone(),
            spill.path(),
            "hashtag_data",
            Duration::from_secs(60),
        );

        let report = uploader.run_once().await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.uploaded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes, 10);

        assert_eq!(remote(&store, "hashtag_data/data_1-000000.parquet").await, b"flat");
        assert_eq!(
            remote(&store, "hashtag_data/tag=go/hashtag_data_a_1-000001.parquet").await,
            b"go"
        );
        assert_eq!(
            remote(&store, "hashtag_data/tag=rust/hashtag_data_b_1-000001.parquet").await,
            b"rust"
        );

        // Files gone, partition dirs pruned, root kept
        assert!(spill.path().is_dir());
        assert_eq!(fs::read_dir(spill.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_in_progress_files_are_skipped() {
        let spill = TempDir::new().unwrap();
        write(spill.path(), "data_1-000000.parquet.tmp", b"partial");

        let store = Arc::new(InMemory::new());
        let uploader = BulkUploader::new(store.clone(), spill.path(), "p", Duration::from_secs(1));

        let report = uploader.run_once().await.unwrap();
        assert_eq!(report, UploadReport::default());
        assert!(spill.path().join("data_1-000000.parquet.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_file_stays_for_next_tick() {
        let spill = TempDir::new().unwrap();
        let remote_dir = TempDir::new().unwrap();
        write(spill.path(), "tag=go/a.parquet", b"a");
        write(spill.path(), "tag=go/b.parquet", b"b");
        let blocked = write(spill.path(), "tag=rust/c.parquet", b"c");

        // A non-empty directory where c.parquet should land makes that put fail
        fs::create_dir_all(remote_dir.path().join("p/tag=rust/c.parquet/occupied")).unwrap();

        let store = Arc::new(LocalFileSystem::new_with_prefix(remote_dir.path()).unwrap());
        let uploader = BulkUploader::new(store, spill.path(), "p", Duration::from_secs(1));

        let report = uploader.run_once().await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 1);

        assert!(blocked.exists());
        assert!(!spill.path().join("tag=go").exists());
        assert_eq!(fs::read(remote_dir.path().join("p/tag=go/a.parquet")).unwrap(), b"a");
        assert_eq!(fs::read(remote_dir.path().join("p/tag=go/b.parquet")).unwrap(), b"b");

        // Clear the obstruction; the retained file goes out on the next tick
        fs::remove_dir_all(remote_dir.path().join("p/tag=rust/c.parquet")).unwrap();
        let report = uploader.run_once().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(!blocked.exists());
    }

    #[tokio::test]
    async fn test_from_config_uses_prefix_and_interval() {
        let spill = TempDir::new().unwrap();
        write(spill.path(), "data_1-000000.parquet", b"flat");

        let config = UploadConfig {
            interval_secs: 30,
            prefix: "exports".to_string(),
        };
        let store = Arc::new(InMemory::new());
        let uploader = BulkUploader::from_config(store.clone(), spill.path(), &config);
        assert_eq!(uploader.interval(), Duration::from_secs(30));
        assert_eq!(uploader.root(), spill.path());

        let report = uploader.run_once().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(remote(&store, "exports/data_1-000000.parquet").await, b"flat");
        // The config is only borrowed
        assert_eq!(config.prefix, "exports");
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let uploader = BulkUploader::new(
            Arc::new(InMemory::new()),
            dir.path().join("missing"),
            "p",
            Duration::from_secs(1),
        );
        assert_eq!(uploader.run_once().await.unwrap(), UploadReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let spill = TempDir::new().unwrap();
        let store = Arc::new(InMemory::new());
        let uploader = Arc::new(BulkUploader::new(
            store.clone(),
            spill.path(),
            "p",
            Duration::from_secs(60),
        ));

        let cancel = CancellationToken::new();
        let task = {
            let uploader = Arc::clone(&uploader);
            let cancel = cancel.clone();
            tokio::spawn(async move { uploader.run(cancel).await })
        };

        // First tick is immediate, the next at 60s
        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();
        let totals = task.await.unwrap();

        assert_eq!(totals.ticks, 2);
        assert_eq!(totals.failed_ticks, 0);
    }
}
