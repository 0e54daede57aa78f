//! Tagstream ingestion pipeline components.
//!
//! This crate provides the pipeline that turns the Bluesky Jetstream
//! firehose into per-tag Parquet files in an object store.
//!
//! # Modules
//!
//! - [`source`] - Frame sources (live Jetstream connector, JSONL replay)
//! - [`pipeline`] - Parsing, buffering and Parquet spill files
//! - [`upload`] - Bulk uploader that moves spill files to the object store
//! - [`daemon`] - Wires the connector and uploader together under one shutdown token
//! - [`config`] / [`storage`] - Layered configuration and object store construction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Jetstream     │  websocket, reconnects with backoff
//! └────────┬────────┘
//!          │ frames
//!          ▼
//! ┌─────────────────┐
//! │ MentionPipeline │  decode → extract tag mentions
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    TagBuffer    │  flushes when the byte threshold is reached
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   SpillWriter   │  Parquet files under the spill root (flat or tag=<tag>/)
//! └────────┬────────┘
//!          │ (own schedule)
//!          ▼
//! ┌─────────────────┐
//! │  BulkUploader   │  put to object store, delete local copy
//! └─────────────────┘
//! ```
//!
//! The spill directory is the hand-off point: nothing is uploaded that was
//! not first written completely to local disk.

pub mod config;
pub mod daemon;
pub mod error;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod upload;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use config::{IngestConfig, SpillLayout, StorageConfig};
pub use daemon::DaemonSummary;

// Re-export pipeline components for convenience
pub use pipeline::{
    BufferStats, FlatWriter, MentionPipeline, PartitionedWriter, PipelineStats, SpillFile,
    SpillWriter, TagBuffer,
};

// Re-export sources
pub use source::{
    BackoffPolicy, Dialer, JetstreamConnector, JsonlConfig, JsonlSource, SourceStats,
    WebSocketDialer,
};

pub use storage::create_object_store;
pub use upload::{BulkUploader, UploadReport, UploadTotals};
