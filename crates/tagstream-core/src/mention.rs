//! Firehose message decoding and tag-mention extraction.
//!
//! Jetstream delivers one JSON envelope per websocket frame. Only commit
//! envelopes for the post collection carry anything we care about: the
//! post record's facets, some of which are tag annotations.
//!
//! ```text
//! { "did": "...", "kind": "commit",
//!   "commit": { "collection": "app.bsky.feed.post", "cid": "...",
//!               "record": { "createdAt": "...", "text": "...",
//!                           "facets": [ { "features": [ { "$type": "...#tag", "tag": "rust" } ] } ] } } }
//! ```
//!
//! Decoding is the only fallible step. Extraction never fails: absent
//! fields default to empty strings and absent lists to empty lists.

use crate::error::{Error, Result};
use crate::{COMMIT_KIND, TAG_FEATURE_TYPE};
use serde::Deserialize;
use std::collections::HashSet;

/// A decoded Jetstream envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    /// Originating account identifier.
    #[serde(default)]
    pub did: String,

    /// Envelope discriminator (`commit`, `identity`, `account`, ...).
    #[serde(default)]
    pub kind: String,

    /// Present when `kind == "commit"`.
    #[serde(default)]
    pub commit: Option<Commit>,
}

impl RawMessage {
    /// Decode an envelope from raw frame bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload is not a JSON object of the
    /// expected shape. Callers treat this as a malformed message.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The commit part of an envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Commit {
    /// Collection NSID, e.g. `app.bsky.feed.post`.
    #[serde(default)]
    pub collection: String,

    /// Content identifier of the committed record.
    #[serde(default)]
    pub cid: String,

    /// `create`, `update` or `delete`.
    #[serde(default)]
    pub operation: String,

    /// The record payload (absent for deletes).
    #[serde(default)]
    pub record: Option<PostRecord>,
}

/// A post record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostRecord {
    #[serde(default, rename = "createdAt")]
    pub created_at: String,

    #[serde(default)]
    pub text: String,

    #[serde(default)]
    pub facets: Vec<Facet>,
}

/// A rich-text annotation over a span of the post text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Facet {
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

/// One feature of a facet (tag, mention, link).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FacetFeature {
    #[serde(default, rename = "$type")]
    pub feature_type: String,

    /// Only set on tag features.
    #[serde(default)]
    pub tag: Option<String>,
}

/// A single tag mention extracted from a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMention {
    /// ISO-8601 creation time as sent by the client (may be empty).
    pub created_at: String,

    /// Commit content identifier.
    pub post_id: String,

    /// Author DID.
    pub author_id: String,

    /// Trimmed, lower-cased tag.
    pub tag: String,

    /// Full post text, for context.
    pub text: String,
}

impl TagMention {
    /// Estimated in-memory footprint in bytes.
    ///
    /// The inline struct size plus the byte length of every string field.
    /// Allocator slack and spare capacity are ignored, so this is a lower
    /// bound used only to pace flushes.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.created_at.len()
            + self.post_id.len()
            + self.author_id.len()
            + self.tag.len()
            + self.text.len()
    }
}

/// Which tags to keep.
///
/// Tracking every tag is the default; an allow-list must be enabled
/// explicitly.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    allowed: Option<HashSet<String>>,
}

impl TagFilter {
    /// Keep every tag.
    pub fn all() -> Self {
        Self { allowed: None }
    }

    /// Keep only the given tags (compared after normalization).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTag`] if an entry is empty after normalization.
    pub fn only<I, S>(tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = HashSet::new();
        for tag in tags {
            let normalized = normalize_tag(tag.as_ref());
            if normalized.is_empty() {
                return Err(Error::InvalidTag {
                    tag: tag.as_ref().to_string(),
                    reason: "empty after normalization".to_string(),
                });
            }
            allowed.insert(normalized);
        }
        Ok(Self {
            allowed: Some(allowed),
        })
    }

    /// Whether filtering is active.
    pub fn is_enabled(&self) -> bool {
        self.allowed.is_some()
    }

    /// Check a normalized tag against the filter.
    pub fn allows(&self, tag: &str) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.contains(tag),
            None => true,
        }
    }
}

/// Normalize a raw tag: trim surrounding whitespace and lower-case.
pub fn normalize_tag(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Extract tag mentions from a decoded envelope.
///
/// Only `commit` envelopes for `collection` are considered. Every facet
/// feature typed as a tag yields one mention, in document order.
pub fn extract_mentions(
    message: &RawMessage,
    collection: &str,
    filter: &TagFilter,
) -> Vec<TagMention> {
    if message.kind != COMMIT_KIND {
        return Vec::new();
    }

    let Some(commit) = message.commit.as_ref() else {
        return Vec::new();
    };
    if commit.collection != collection {
        return Vec::new();
    }
    let Some(record) = commit.record.as_ref() else {
        return Vec::new();
    };

    let mut mentions = Vec::new();
    for feature in record.facets.iter().flat_map(|f| f.features.iter()) {
        if feature.feature_type != TAG_FEATURE_TYPE {
            continue;
        }

        let tag = normalize_tag(feature.tag.as_deref().unwrap_or_default());
        if !filter.allows(&tag) {
            continue;
        }

        mentions.push(TagMention {
            created_at: record.created_at.clone(),
            post_id: commit.cid.clone(),
            author_id: message.did.clone(),
            tag,
            text: record.text.clone(),
        });
    }

    mentions
}
