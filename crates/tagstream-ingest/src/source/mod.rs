//! Frame sources.
//!
//! This module provides the adapters that feed raw frames into a
//! [`MentionPipeline`](crate::pipeline::MentionPipeline).
//!
//! # Available Sources
//!
//! - [`JetstreamConnector`] - Live websocket connection with reconnect/backoff
//! - [`JsonlSource`] - Replays captured firehose dumps (one frame per line)

mod jetstream;
mod jsonl;

pub use jetstream::{
    BackoffPolicy, ConnectionState, Dialer, FailureClass, Frame, JetstreamConnector,
    WebSocketDialer,
};
pub use jsonl::{JsonlConfig, JsonlSource};

/// Statistics from running a frame source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Payload frames handed to the pipeline.
    pub frames: u64,

    /// Successful connections (live source only).
    pub connects: u64,

    /// Failures classified as a closed connection.
    pub closed_failures: u64,

    /// Failures of any other kind, including connect errors and timeouts.
    pub error_failures: u64,

    /// Receive waits that hit the idle timeout.
    pub idle_timeouts: u64,

    /// For file sources: files processed.
    pub files_processed: u64,
}
