//! Core types, message parsing and shared utilities for tagstream.
//!
//! This crate provides:
//! - Jetstream envelope decoding and tag-mention extraction
//! - The optional tag allow-list ([`TagFilter`])
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod mention;
pub mod metrics;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Collection NSID of Bluesky posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Facet feature `$type` marking a tag annotation.
pub const TAG_FEATURE_TYPE: &str = "app.bsky.richtext.facet#tag";

/// Envelope `kind` of repository commits.
pub const COMMIT_KIND: &str = "commit";

/// Default Jetstream subscription endpoint.
pub const DEFAULT_JETSTREAM_ENDPOINT: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

pub use error::{Error, Result};
pub use mention::{
    Commit, Facet, FacetFeature, PostRecord, RawMessage, TagFilter, TagMention, extract_mentions,
    normalize_tag,
};
