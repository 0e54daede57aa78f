//! In-memory tag-mention buffer with a byte threshold.
//!
//! The buffer is owned by whoever drives ingestion (the connector task or
//! the replay tool); nothing else reads it. A flush swaps the live vector
//! for an empty one and serializes the swapped-out snapshot on the blocking
//! pool, so the live buffer is never serialized in place.
//!
//! # Size estimate
//!
//! Each record counts `size_of::<TagMention>()` plus the byte length of its
//! five strings. Allocator overhead and spare capacity are ignored; the
//! threshold is a pacing heuristic, not a hard memory cap.

use super::spill::{SpillFile, SpillWriter};
use crate::Result;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tagstream_core::TagMention;
use tokio::time::Instant;
use tracing::{error, info};

/// Running buffer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Records appended since start.
    pub records_appended: usize,
    /// Non-empty flushes that succeeded.
    pub flushes: usize,
    /// Flushes that failed and were restored.
    pub flush_errors: usize,
    /// Records written to spill files.
    pub records_flushed: usize,
    /// Spill files written.
    pub files_written: usize,
}

/// Ordered tag-mention buffer.
pub struct TagBuffer {
    records: Vec<TagMention>,
    size_bytes: usize,
    max_bytes: usize,
    writer: Arc<dyn SpillWriter>,
    log_interval: Option<Duration>,
    last_log: Instant,
    stats: BufferStats,
}

impl TagBuffer {
    /// Create an empty buffer that reports a full threshold at `max_bytes`.
    pub fn new(max_bytes: usize, writer: Arc<dyn SpillWriter>) -> Self {
        Self {
            records: Vec::new(),
            size_bytes: 0,
            max_bytes,
            writer,
            log_interval: None,
            last_log: Instant::now(),
            stats: BufferStats::default(),
        }
    }

    /// Log the buffer size at most once per `interval` while appending.
    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Append records. Returns `true` when the threshold has been reached.
    pub fn append(&mut self, records: Vec<TagMention>) -> bool {
        self.stats.records_appended += records.len();
        self.size_bytes += records.iter().map(TagMention::estimated_size).sum::<usize>();
        self.records.extend(records);
        self.publish_gauges();

        if let Some(interval) = self.log_interval
            && self.last_log.elapsed() >= interval
        {
            info!(
                "Current buffer size: {:.2} MB ({} records)",
                self.size_bytes as f64 / (1024.0 * 1024.0),
                self.records.len()
            );
            self.last_log = Instant::now();
        }

        self.is_full()
    }

    /// Whether the estimate has reached the threshold.
    pub fn is_full(&self) -> bool {
        self.size_bytes >= self.max_bytes
    }

    /// Write the buffered records to spill files and reset the buffer.
    ///
    /// An empty buffer is a logged no-op returning no files. If the writer
    /// fails or panics, the snapshot goes back in front of the buffer and the
    /// error is returned; nothing is lost.
    pub async fn flush(&mut self) -> Result<Vec<SpillFile>> {
        if self.records.is_empty() {
            info!("Buffer is empty, skipping flush");
            return Ok(Vec::new());
        }

        // Held here as well so a panicking writer cannot take the records with it
        let snapshot = Arc::new(std::mem::take(&mut self.records));
        let snapshot_bytes = std::mem::take(&mut self.size_bytes);
        self.publish_gauges();

        let writer = Arc::clone(&self.writer);
        let task_snapshot = Arc::clone(&snapshot);
        let result = tokio::task::spawn_blocking(move || writer.write(&task_snapshot))
            .await
            .unwrap_or_else(|join_err| Err(join_err.into()));

        match result {
            Ok(files) => {
                self.stats.flushes += 1;
                self.stats.records_flushed += snapshot.len();
                self.stats.files_written += files.len();

                counter!("buffer_flushes_total").increment(1);
                counter!("spill_files_written_total").increment(files.len() as u64);
                counter!("spill_bytes_written_total")
                    .increment(files.iter().map(|f| f.bytes).sum::<u64>());

                info!(
                    "Flushed {} records ({:.2} MB estimated) into {} spill file(s)",
                    snapshot.len(),
                    snapshot_bytes as f64 / (1024.0 * 1024.0),
                    files.len()
                );
                Ok(files)
            }
            Err(e) => {
                self.stats.flush_errors += 1;
                counter!("buffer_flush_errors_total").increment(1);
                error!(
                    "Flush of {} records failed, keeping them buffered: {}",
                    snapshot.len(),
                    e
                );

                let newer = std::mem::replace(&mut self.records, Arc::unwrap_or_clone(snapshot));
                self.records.extend(newer);
                self.size_bytes += snapshot_bytes;
                self.publish_gauges();
                Err(e)
            }
        }
    }

    /// Buffered records, oldest first.
    pub fn records(&self) -> &[TagMention] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current size estimate in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    fn publish_gauges(&self) {
        gauge!("buffer_records").set(self.records.len() as f64);
        gauge!("buffer_bytes").set(self.size_bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::config::Compression;
    use crate::pipeline::spill::{FlatWriter, read_spill_file};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn mention(tag: &str, post_id: &str) -> TagMention {
        TagMention {
            created_at: "2024-11-19T10:00:00Z".to_string(),
            post_id: post_id.to_string(),
            author_id: "did:plc:author".to_string(),
            tag: tag.to_string(),
            text: "hello".to_string(),
        }
    }

    fn flat_buffer(dir: &TempDir, max_bytes: usize) -> TagBuffer {
        let writer = Arc::new(FlatWriter::new(dir.path(), Compression::Snappy).unwrap());
        TagBuffer::new(max_bytes, writer)
    }

    /// Writer that fails a fixed number of times, then succeeds.
    struct FlakyWriter {
        inner: FlatWriter,
        failures_left: AtomicUsize,
    }

    impl SpillWriter for FlakyWriter {
        fn write(&self, records: &[TagMention]) -> Result<Vec<SpillFile>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Spill("disk full".to_string()));
            }
            self.inner.write(records)
        }

        fn root(&self) -> &Path {
            self.inner.root()
        }
    }

    #[tokio::test]
    async fn test_append_then_flush_preserves_order() {
        let dir = TempDir::new().unwrap();
        let mut buffer = flat_buffer(&dir, usize::MAX);

        buffer.append(vec![mention("go", "a"), mention("rust", "b")]);
        buffer.append(vec![mention("sql", "c")]);
        assert_eq!(buffer.len(), 3);

        let files = buffer.flush().await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.size_bytes(), 0);

        let post_ids: Vec<String> = read_spill_file(&files[0].path)
            .unwrap()
            .into_iter()
            .map(|r| r.post_id)
            .collect();
        assert_eq!(post_ids, vec!["a", "b", "c"]);
        assert_eq!(buffer.stats().records_flushed, 3);
    }

    #[tokio::test]
    async fn test_flush_empty_is_idempotent_noop() {
        let dir = TempDir::new().unwrap();
        let mut buffer = flat_buffer(&dir, 1024);

        assert!(buffer.flush().await.unwrap().is_empty());
        assert!(buffer.flush().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(buffer.stats().flushes, 0);
    }

    #[tokio::test]
    async fn test_append_reports_threshold() {
        let dir = TempDir::new().unwrap();
        let one = mention("go", "a").estimated_size();
        let mut buffer = flat_buffer(&dir, one * 2);

        assert!(!buffer.append(vec![mention("go", "a")]));
        assert_eq!(buffer.size_bytes(), one);
        assert!(buffer.append(vec![mention("go", "b")]));
        assert!(buffer.is_full());
    }

    #[tokio::test]
    async fn test_failed_flush_restores_snapshot() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(FlakyWriter {
            inner: FlatWriter::new(dir.path(), Compression::Snappy).unwrap(),
            failures_left: AtomicUsize::new(1),
        });
        let mut buffer = TagBuffer::new(usize::MAX, writer);

        buffer.append(vec![mention("go", "a"), mention("go", "b")]);
        let size_before = buffer.size_bytes();

        assert!(buffer.flush().await.is_err());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.size_bytes(), size_before);
        assert_eq!(buffer.stats().flush_errors, 1);

        buffer.append(vec![mention("rust", "c")]);
        let files = buffer.flush().await.unwrap();
        let post_ids: Vec<String> = read_spill_file(&files[0].path)
            .unwrap()
            .into_iter()
            .map(|r| r.post_id)
            .collect();
        assert_eq!(post_ids, vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    struct PanickingWriter {
        root: std::path::PathBuf,
    }

    impl SpillWriter for PanickingWriter {
        fn write(&self, _records: &[TagMention]) -> Result<Vec<SpillFile>> {
            panic!("offset overflow");
        }

        fn root(&self) -> &Path {
            &self.root
        }
    }

    #[tokio::test]
    async fn test_panicking_writer_keeps_records() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(PanickingWriter {
            root: dir.path().to_path_buf(),
        });
        let mut buffer = TagBuffer::new(usize::MAX, writer);

        buffer.append(vec![mention("go", "a"), mention("rust", "b")]);
        let size_before = buffer.size_bytes();

        let result = buffer.flush().await;
        assert!(matches!(result, Err(Error::Task(_))));
        assert_eq!(buffer.stats().flush_errors, 1);
        assert_eq!(buffer.size_bytes(), size_before);

        let post_ids: Vec<&str> = buffer.records().iter().map(|r| r.post_id.as_str()).collect();
        assert_eq!(post_ids, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_interval_is_optional() {
        let dir = TempDir::new().unwrap();
        let mut buffer = flat_buffer(&dir, usize::MAX).with_log_interval(Duration::ZERO);
        assert!(buffer.log_interval.is_none());

        buffer = buffer.with_log_interval(Duration::from_secs(5));
        buffer.append(vec![mention("go", "a")]);
        tokio::time::advance(Duration::from_secs(6)).await;
        buffer.append(vec![mention("go", "b")]);
        assert!(buffer.last_log.elapsed() < Duration::from_secs(1));
    }
}
