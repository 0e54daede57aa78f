//! Core pipeline components for tag-mention ingestion.
//!
//! This module provides the shared path every frame source feeds into:
//!
//! - [`MentionPipeline`] - Decodes frames, extracts mentions, drives flushes
//! - [`TagBuffer`] - In-memory buffer with a byte threshold
//! - [`SpillWriter`] - Serializes buffer snapshots to Parquet spill files
//!
//! # Architecture
//!
//! ```text
//! [frame] → RawMessage::from_slice → extract_mentions → [TagBuffer] → (threshold) → [SpillWriter]
//!                                                                                       ↓
//!                                                                               {spill root}/*.parquet
//! ```
//!
//! Uploading is not part of the pipeline; the bulk uploader picks finished
//! files up from disk on its own schedule.

mod buffer;
mod spill;

pub use buffer::{BufferStats, TagBuffer};
pub use spill::{
    FlatWriter, IN_PROGRESS_EXTENSION, PartitionedWriter, SpillFile, SpillWriter, build_writer,
    is_in_progress, mention_schema, read_spill_file, sanitize_tag,
};

use crate::Result;
use metrics::counter;
use tagstream_core::{RawMessage, TagFilter, extract_mentions};
use tracing::{debug, error, info};

/// Frame-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames handed to the pipeline.
    pub messages: u64,
    /// Frames that failed to decode.
    pub malformed: u64,
    /// Posts that produced at least one mention.
    pub posts_tagged: u64,
    /// Mentions appended to the buffer.
    pub mentions: u64,
}

/// Parser → Buffer → File Writer.
pub struct MentionPipeline {
    buffer: TagBuffer,
    collection: String,
    filter: TagFilter,
    progress_interval: u64,
    stats: PipelineStats,
}

impl MentionPipeline {
    /// Create a pipeline accepting commits for `collection`.
    pub fn new(buffer: TagBuffer, collection: impl Into<String>, filter: TagFilter) -> Self {
        Self {
            buffer,
            collection: collection.into(),
            filter,
            progress_interval: 0,
            stats: PipelineStats::default(),
        }
    }

    /// Log progress every `interval` tagged posts (0 disables).
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Handle one raw frame. Returns the number of mentions buffered.
    ///
    /// A malformed frame is dropped with a debug log. When the append
    /// crosses the threshold, the flush completes before this returns.
    pub async fn handle_frame(&mut self, payload: &[u8]) -> usize {
        self.stats.messages += 1;
        counter!("ingest_messages_total").increment(1);

        let message = match RawMessage::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed += 1;
                counter!("ingest_messages_malformed_total").increment(1);
                debug!("Dropping malformed message: {}", e);
                return 0;
            }
        };

        let mentions = extract_mentions(&message, &self.collection, &self.filter);
        if mentions.is_empty() {
            return 0;
        }

        let count = mentions.len();
        self.stats.posts_tagged += 1;
        self.stats.mentions += count as u64;
        counter!("ingest_posts_tagged_total").increment(1);
        counter!("ingest_mentions_total").increment(count as u64);

        if self.progress_interval > 0
            && self.stats.posts_tagged.is_multiple_of(self.progress_interval)
        {
            info!(
                "Progress: {} tagged posts, {} mentions, {} messages ({} malformed)",
                self.stats.posts_tagged,
                self.stats.mentions,
                self.stats.messages,
                self.stats.malformed
            );
        }

        if self.buffer.append(mentions) {
            // Errors are logged by the buffer; records stay buffered
            if let Ok(files) = self.buffer.flush().await {
                for file in &files {
                    info!(
                        "Wrote spill file {} ({} records)",
                        file.path.display(),
                        file.record_count
                    );
                }
            }
        }

        count
    }

    /// Flush whatever is buffered (shutdown, end of replay).
    pub async fn flush(&mut self) -> Result<Vec<SpillFile>> {
        self.buffer.flush().await.inspect_err(|e| {
            error!("Final flush failed: {}", e);
        })
    }

    pub fn buffer(&self) -> &TagBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use serde_json::json;
    use std::sync::Arc;
    use tagstream_core::{POST_COLLECTION, TAG_FEATURE_TYPE, TagMention};
    use tempfile::TempDir;

    fn post_frame(cid: &str, tags: &[&str]) -> Vec<u8> {
        let features: Vec<_> = tags
            .iter()
            .map(|t| json!({ "$type": TAG_FEATURE_TYPE, "tag": t }))
            .collect();
        json!({
            "did": "did:plc:author",
            "kind": "commit",
            "commit": {
                "collection": POST_COLLECTION,
                "cid": cid,
                "record": {
                    "createdAt": "2024-11-19T10:00:00Z",
                    "text": "text",
                    "facets": [ { "features": features } ]
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    fn pipeline(dir: &TempDir, max_bytes: usize, filter: TagFilter) -> MentionPipeline {
        let writer = Arc::new(FlatWriter::new(dir.path(), Compression::Snappy).unwrap());
        MentionPipeline::new(TagBuffer::new(max_bytes, writer), POST_COLLECTION, filter)
    }

    #[tokio::test]
    async fn test_handle_frame_buffers_mentions() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = pipeline(&dir, usize::MAX, TagFilter::all());

        assert_eq!(pipeline.handle_frame(&post_frame("a", &["Go", "rust"])).await, 2);
        assert_eq!(pipeline.handle_frame(&post_frame("b", &[])).await, 0);

        let tags: Vec<&str> = pipeline
            .buffer()
            .records()
            .iter()
            .map(|r| r.tag.as_str())
            .collect();
        assert_eq!(tags, vec!["go", "rust"]);
        assert_eq!(pipeline.stats().messages, 2);
        assert_eq!(pipeline.stats().posts_tagged, 1);
        assert_eq!(pipeline.stats().mentions, 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = pipeline(&dir, usize::MAX, TagFilter::all());

        assert_eq!(pipeline.handle_frame(b"{\"kind\": \"commit\"").await, 0);
        assert_eq!(pipeline.handle_frame(&post_frame("a", &["go"])).await, 1);
        assert_eq!(pipeline.stats().malformed, 1);
        assert_eq!(pipeline.buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_filter_applies_when_enabled() {
        let dir = TempDir::new().unwrap();
        let filter = TagFilter::only(["rust"]).unwrap();
        let mut pipeline = pipeline(&dir, usize::MAX, filter);

        assert_eq!(pipeline.handle_frame(&post_frame("a", &["go", "RUST"])).await, 1);
        assert_eq!(pipeline.buffer().records()[0].tag, "rust");
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush_before_next_frame() {
        let dir = TempDir::new().unwrap();
        let sample = TagMention {
            created_at: "2024-11-19T10:00:00Z".to_string(),
            post_id: "a".to_string(),
            author_id: "did:plc:author".to_string(),
            tag: "go".to_string(),
            text: "text".to_string(),
        };
        let mut pipeline = pipeline(&dir, sample.estimated_size() * 2, TagFilter::all());

        pipeline.handle_frame(&post_frame("a", &["go"])).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        pipeline.handle_frame(&post_frame("b", &["go"])).await;
        assert!(pipeline.buffer().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert_eq!(pipeline.buffer().stats().flushes, 1);
    }
}
