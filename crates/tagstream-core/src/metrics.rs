//! Prometheus metrics helpers for tagstream.
//!
//! This module provides centralized metrics initialization and the metric
//! descriptions used across the ingestion pipeline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tagstream_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("ingest_messages_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`stream_`, `ingest_`, `buffer_`, `spill_`, `upload_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: only for low-cardinality reasons (never per tag)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed,
/// instead of panicking. Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds the listener immediately (so a taken port is reported to the
/// caller) and serves `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the pipeline metrics.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    describe_gauge!("ingestion_running", "1 while the daemon is running");

    // =========================================================================
    // Stream Connector
    // =========================================================================

    describe_counter!(
        "stream_connects_total",
        "Successful websocket connections to the firehose"
    );
    describe_counter!(
        "stream_failures_total",
        "Connection failures (label: class = closed | error)"
    );
    describe_gauge!(
        "stream_connection_state",
        "Connector state (0=disconnected, 1=connecting, 2=connected, 3=backoff)"
    );
    describe_counter!(
        "stream_idle_timeouts_total",
        "Receive waits that hit the idle timeout"
    );

    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!("ingest_messages_total", "Frames received from the stream");
    describe_counter!(
        "ingest_messages_malformed_total",
        "Frames dropped because they could not be decoded"
    );
    describe_counter!(
        "ingest_posts_tagged_total",
        "Posts that yielded at least one tag mention"
    );
    describe_counter!("ingest_mentions_total", "Tag mentions appended to the buffer");

    // =========================================================================
    // Buffer and Spill Files
    // =========================================================================

    describe_gauge!("buffer_records", "Records held in the in-memory buffer");
    describe_gauge!(
        "buffer_bytes",
        "Estimated in-memory size of the buffer in bytes"
    );
    describe_counter!("buffer_flushes_total", "Non-empty buffer flushes");
    describe_counter!(
        "buffer_flush_errors_total",
        "Flushes that failed and were restored to the buffer"
    );
    describe_counter!("spill_files_written_total", "Parquet spill files written");
    describe_counter!(
        "spill_bytes_written_total",
        "Bytes of Parquet spill files written"
    );

    // =========================================================================
    // Bulk Uploader
    // =========================================================================

    describe_counter!("upload_ticks_total", "Uploader scan cycles");
    describe_counter!(
        "upload_files_total",
        "Spill files uploaded and deleted locally"
    );
    describe_counter!("upload_bytes_total", "Bytes uploaded to the object store");
    describe_counter!(
        "upload_failures_total",
        "Per-file upload failures (file kept for the next tick)"
    );
    describe_gauge!(
        "upload_pending_files",
        "Spill files found on disk at the start of the last tick"
    );
}
