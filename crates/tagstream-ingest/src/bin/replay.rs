//! Replay captured Jetstream frames into Parquet spill files.
//!
//! This tool reads JSONL files where each line is one Jetstream envelope
//! (as captured from the firehose, optionally gzip-compressed), runs them
//! through the same pipeline as the live daemon and writes the resulting
//! tag mentions to a spill directory.
//!
//! # Pipeline
//!
//! ```text
//! [JSONL Files] → [MentionPipeline] → [TagBuffer] → [SpillWriter] → (--upload) → [Object Store]
//!                                                         ↓
//!                                                    spill root/
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Single file, flat layout
//! tagstream-replay -i capture.jsonl -o ./data/
//!
//! # Directory of captures, one file per tag, only a few tags
//! tagstream-replay -i ./captures/ -o ./data/ --layout partitioned --tags rust,golang
//!
//! # Upload the result using the daemon's storage settings
//! tagstream-replay -i ./captures/ -o ./data/ --upload --config tagstream.toml
//! ```

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueEnum};
use metrics::gauge;
use std::path::PathBuf;
use std::time::Instant;
use tagstream_core::metrics::{init_metrics, start_metrics_server};
use tagstream_core::{POST_COLLECTION, TagFilter};
use tagstream_ingest::config::{
    Compression, DEFAULT_MAX_BUFFER_BYTES, MAX_BUFFER_BYTES, SpillConfig,
};
use tagstream_ingest::pipeline::build_writer;
use tagstream_ingest::{
    BulkUploader, IngestConfig, JsonlConfig, JsonlSource, MentionPipeline, SpillLayout,
    TagBuffer, create_object_store,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Replay captured firehose frames into Parquet spill files.
#[derive(Parser, Debug)]
#[command(name = "tagstream-replay")]
#[command(about = "Replay JSONL firehose captures into Parquet spill files")]
struct Args {
    /// Input JSONL file or directory path
    #[arg(short, long)]
    input: PathBuf,

    /// Spill root for the Parquet files
    #[arg(short, long)]
    output: PathBuf,

    /// Spill file layout
    #[arg(long, value_enum, default_value = "flat")]
    layout: LayoutArg,

    /// Parquet compression codec
    #[arg(long, value_enum, default_value = "snappy")]
    compression: CompressionArg,

    /// Buffer threshold in bytes before a spill file is written
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER_BYTES)]
    max_bytes: usize,

    /// Only keep these tags (comma-separated, normalized before matching)
    #[arg(long, value_delimiter = ',')]
    tags: Option<Vec<String>>,

    /// Collection to keep (posts by default)
    #[arg(long, default_value = POST_COLLECTION)]
    collection: String,

    /// Limit number of files to process (for testing)
    #[arg(long)]
    limit: Option<usize>,

    /// Print progress every N lines
    #[arg(long, default_value = "100000")]
    progress_interval: u64,

    /// Upload the spill root once after the replay
    #[arg(long)]
    upload: bool,

    /// Config file with the storage settings used by --upload
    #[arg(long)]
    config: Option<PathBuf>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Flat,
    Partitioned,
}

impl From<LayoutArg> for SpillLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Flat => SpillLayout::Flat,
            LayoutArg::Partitioned => SpillLayout::Partitioned,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressionArg {
    None,
    Snappy,
    Zstd,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Snappy => Compression::Snappy,
            CompressionArg::Zstd => Compression::Zstd,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    ensure!(
        args.max_bytes > 0 && args.max_bytes <= MAX_BUFFER_BYTES,
        "--max-bytes must be between 1 and {}",
        MAX_BUFFER_BYTES
    );

    // Resolve the upload target first so a bad config fails before any work
    let upload_target = if args.upload {
        let config = IngestConfig::load(args.config.as_deref())
            .context("Failed to load configuration")?;
        config
            .storage
            .validate()
            .context("Invalid storage configuration")?;
        let store = create_object_store(&config.storage)?;
        Some((store, config.upload))
    } else {
        None
    };

    let filter = match &args.tags {
        Some(tags) => TagFilter::only(tags).context("Invalid --tags")?,
        None => TagFilter::all(),
    };

    // Initialize metrics and start server (if enabled)
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("ingestion_running").set(1.0);
    }

    let writer = build_writer(&SpillConfig {
        root: args.output.clone(),
        layout: args.layout.into(),
        compression: args.compression.into(),
    })
    .with_context(|| format!("Failed to prepare spill root {}", args.output.display()))?;
    let buffer = TagBuffer::new(args.max_bytes, writer);
    let mut pipeline = MentionPipeline::new(buffer, args.collection.clone(), filter);

    let cancel = CancellationToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Interrupt received, finishing the current line...");
        handler_cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let start = Instant::now();
    let source = JsonlSource::new(JsonlConfig {
        input: args.input.clone(),
        limit: args.limit,
        progress_interval: args.progress_interval,
    });
    let source_stats = source.run(&mut pipeline, &cancel).await?;

    // Whatever is left below the threshold still belongs in a file
    pipeline.flush().await.context("Final flush failed")?;
    let elapsed = start.elapsed();

    let upload_report = match upload_target {
        Some((store, upload)) => {
            let uploader = BulkUploader::from_config(store, args.output.clone(), &upload);
            Some(uploader.run_once().await?)
        }
        None => None,
    };

    // Mark as no longer running
    gauge!("ingestion_running").set(0.0);

    let pipeline_stats = pipeline.stats();
    let buffer_stats = pipeline.buffer().stats();

    println!("\n══════════════════════════════════════════════════════════════════");
    println!("SUMMARY");
    println!("══════════════════════════════════════════════════════════════════\n");

    println!("Input:       {}", args.input.display());
    println!("Output:      {}", args.output.display());
    println!();
    println!("Files processed:   {:>12}", source_stats.files_processed);
    println!("Lines replayed:    {:>12}", source_stats.frames);
    println!("Malformed lines:   {:>12}", pipeline_stats.malformed);
    println!("Tagged posts:      {:>12}", pipeline_stats.posts_tagged);
    println!("Mentions:          {:>12}", pipeline_stats.mentions);
    println!();
    println!("Spill files:       {:>12}", buffer_stats.files_written);
    println!("Records written:   {:>12}", buffer_stats.records_flushed);
    if let Some(report) = upload_report {
        println!(
            "Uploaded:          {:>12} ({} failed, {} bytes)",
            report.uploaded, report.failed, report.bytes
        );
    }
    println!();
    println!("Elapsed:           {:>12.2?}", elapsed);

    Ok(())
}
