//! Tagstream live ingestion daemon.
//!
//! Connects to the Bluesky Jetstream firehose, extracts tag mentions from
//! posts, spills them to local Parquet files and periodically moves those
//! files to the configured object store.
//!
//! # Usage
//!
//! ```bash
//! # Run with ./tagstream.toml (if present) and the environment
//! tagstream-ingest
//!
//! # Run with an explicit config file
//! tagstream-ingest --config /etc/tagstream/tagstream.toml
//!
//! # Override single settings through the environment
//! TAGSTREAM_BUFFER__MAX_BYTES=1048576 tagstream-ingest
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM for graceful shutdown:
//! 1. Stops receiving from the firehose
//! 2. Flushes the buffer to a final spill file
//! 3. Stops the uploader (leftover files are uploaded on the next start)
//! 4. Exits cleanly

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use std::path::PathBuf;
use tagstream_core::metrics::{init_metrics, start_metrics_server};
use tagstream_ingest::{IngestConfig, create_object_store, daemon};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Tagstream live ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "tagstream-ingest")]
#[command(about = "Live Bluesky tag-mention ingestion daemon")]
#[command(version)]
struct Args {
    /// Path to a TOML config file (defaults to ./tagstream.toml if present)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Metrics HTTP server port (0 to disable, overrides the config file)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("tagstream_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Tagstream ingestion daemon starting...");

    let mut config = IngestConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = args.metrics_port {
        config.metrics.port = port;
    }
    config.validate().context("Invalid configuration")?;

    // Everything that can fail on bad settings happens before any task starts
    let store = create_object_store(&config.storage).context("Failed to create object store")?;

    tracing::info!("Configuration:");
    tracing::info!("  Endpoint: {}", config.stream.endpoint);
    tracing::info!("  Collection: {}", config.stream.collection);
    tracing::info!(
        "  Buffer: {} bytes (flush on shutdown: {})",
        config.buffer.max_bytes,
        config.buffer.flush_on_shutdown
    );
    tracing::info!(
        "  Spill: {} ({:?}, {:?})",
        config.spill.root.display(),
        config.spill.layout,
        config.spill.compression
    );
    tracing::info!(
        "  Upload: every {}s to {} storage under '{}'",
        config.upload.interval_secs,
        config.storage.kind(),
        config.upload.prefix
    );
    tracing::info!(
        "  Tag filter: {}",
        if config.filter.enabled {
            format!("{} tags", config.filter.tags.len())
        } else {
            "disabled".to_string()
        }
    );

    if args.check {
        tracing::info!("Configuration OK");
        return Ok(());
    }

    // Initialize metrics
    if config.metrics.port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(config.metrics.port, metrics_handle)
            .await
            .with_context(|| format!("Failed to bind metrics port {}", config.metrics.port))?;
        gauge!("ingestion_running").set(1.0);
    }

    // Set up graceful shutdown
    let cancel = CancellationToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        handler_cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    tracing::info!("Starting live ingestion...");
    let summary = daemon::run(config, store, cancel)
        .await
        .context("Ingestion failed")?;

    // Mark as stopped
    gauge!("ingestion_running").set(0.0);

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Frames received:      {}", summary.source.frames);
    tracing::info!("Malformed frames:     {}", summary.pipeline.malformed);
    tracing::info!("Tagged posts:         {}", summary.pipeline.posts_tagged);
    tracing::info!("Mentions extracted:   {}", summary.pipeline.mentions);
    tracing::info!("Records spilled:      {}", summary.records_flushed);
    tracing::info!("Spill files written:  {}", summary.files_written);
    tracing::info!("Files uploaded:       {}", summary.uploads.files.uploaded);
    tracing::info!("Connections:          {}", summary.source.connects);
    tracing::info!(
        "Failures:             {} closed, {} error, {} idle timeouts",
        summary.source.closed_failures,
        summary.source.error_failures,
        summary.source.idle_timeouts
    );
    if summary.records_unflushed > 0 {
        tracing::warn!("Records lost:         {}", summary.records_unflushed);
    }

    Ok(())
}
