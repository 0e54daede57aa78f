//! Orchestration of the live daemon.
//!
//! Two tasks, sharing nothing but the spill directory:
//!
//! - the connector task owns the pipeline (and with it the buffer)
//! - the uploader task moves finished files to the object store
//!
//! Both stop when the cancellation token fires. With
//! `buffer.flush_on_shutdown` the connector writes whatever is still
//! buffered before returning; those files are uploaded on the next run.

use crate::Result;
use crate::config::IngestConfig;
use crate::pipeline::{MentionPipeline, PipelineStats, TagBuffer, build_writer};
use crate::source::{BackoffPolicy, Dialer, JetstreamConnector, SourceStats, WebSocketDialer};
use crate::upload::{BulkUploader, UploadTotals};
use object_store::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the daemon did before it stopped.
#[derive(Debug, Clone, Default)]
pub struct DaemonSummary {
    pub source: SourceStats,
    pub pipeline: PipelineStats,
    pub records_flushed: usize,
    pub files_written: usize,
    /// Records still buffered at exit (only when the final flush is off or failed).
    pub records_unflushed: usize,
    pub uploads: UploadTotals,
}

/// Run the daemon against the live Jetstream endpoint.
pub async fn run(
    config: IngestConfig,
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
) -> Result<DaemonSummary> {
    let dialer = WebSocketDialer::new(&config.stream.endpoint, &config.stream.collection)?;
    run_with_dialer(config, store, dialer, cancel).await
}

/// Run the daemon with any [`Dialer`].
///
/// Everything fallible (filter, spill root) is set up before the tasks
/// are spawned.
pub async fn run_with_dialer<D>(
    config: IngestConfig,
    store: Arc<dyn ObjectStore>,
    dialer: D,
    cancel: CancellationToken,
) -> Result<DaemonSummary>
where
    D: Dialer + 'static,
{
    let filter = config.filter.to_filter()?;
    if filter.is_enabled() {
        info!("Tag filter enabled: {} tag(s)", config.filter.tags.len());
    }

    let writer = build_writer(&config.spill)?;
    let buffer = TagBuffer::new(config.buffer.max_bytes, writer)
        .with_log_interval(Duration::from_secs(config.buffer.log_interval_secs));
    let mut pipeline = MentionPipeline::new(buffer, config.stream.collection.clone(), filter)
        .with_progress_interval(config.stream.progress_interval);

    let policy = BackoffPolicy {
        closed: Duration::from_secs(config.stream.closed_backoff_secs),
        error: Duration::from_secs(config.stream.error_backoff_secs),
    };
    let mut connector = JetstreamConnector::new(dialer, policy, config.stream.idle_timeout())
        .with_connect_timeout(config.stream.connect_timeout());

    let uploader = BulkUploader::from_config(store, config.spill.root.clone(), &config.upload);

    let flush_on_shutdown = config.buffer.flush_on_shutdown;
    let connector_cancel = cancel.clone();
    let connector_task = tokio::spawn(async move {
        let source = connector.run(&mut pipeline, &connector_cancel).await;
        if flush_on_shutdown && !pipeline.buffer().is_empty() {
            info!("Flushing {} buffered records before exit", pipeline.buffer().len());
            // Logged inside on failure; the count below reports what is left
            let _ = pipeline.flush().await;
        }
        (source, pipeline)
    });

    let uploader_cancel = cancel.clone();
    let uploader_task = tokio::spawn(async move { uploader.run(uploader_cancel).await });

    let (connector_result, uploader_result) = tokio::join!(connector_task, uploader_task);

    // A panicked task must not leave its sibling running
    if connector_result.is_err() || uploader_result.is_err() {
        cancel.cancel();
    }
    let (source, pipeline) = connector_result?;
    let uploads = uploader_result?;

    let buffer_stats = pipeline.buffer().stats().clone();
    let summary = DaemonSummary {
        source,
        pipeline: pipeline.stats().clone(),
        records_flushed: buffer_stats.records_flushed,
        files_written: buffer_stats.files_written,
        records_unflushed: pipeline.buffer().len(),
        uploads,
    };

    if summary.records_unflushed > 0 {
        warn!(
            "{} records were not written before exit",
            summary.records_unflushed
        );
    }

    Ok(summary)
}
