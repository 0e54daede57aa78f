//! Configuration for the ingestion daemon.
//!
//! Values are layered (later sources override earlier):
//!
//! 1. Built-in defaults
//! 2. `tagstream.toml` in the current directory (or the `--config` path)
//! 3. `AZURE_BLOB_STORAGE_CONNECTION_STRING`, mapped to `storage.connection_string`
//! 4. Environment variables prefixed with `TAGSTREAM_`, nested with `__`
//!    (e.g. `TAGSTREAM_BUFFER__MAX_BYTES=1048576`)
//!
//! Loading never checks semantics; call [`IngestConfig::validate`] before
//! spawning anything.

use crate::{Error, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tagstream_core::{DEFAULT_JETSTREAM_ENDPOINT, POST_COLLECTION, TagFilter};

// ============================================================================
// Defaults
// ============================================================================

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "tagstream.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TAGSTREAM_";

/// Legacy environment variable holding the Azure connection string.
pub const AZURE_CONNECTION_STRING_ENV: &str = "AZURE_BLOB_STORAGE_CONNECTION_STRING";

/// Buffer threshold before a flush (10 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// Largest accepted buffer threshold (1 GiB).
///
/// Spill columns use 32-bit string offsets, so one snapshot must stay well
/// below 2 GiB of text.
pub const MAX_BUFFER_BYTES: usize = 1024 * 1024 * 1024;

/// Idle receive timeout in seconds. Hitting it is not a failure.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 5;

/// Backoff after the server closed the connection.
pub const DEFAULT_CLOSED_BACKOFF_SECS: u64 = 5;

/// Backoff after any other connection error.
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 10;

/// Upper bound for establishing the websocket connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Bulk upload interval in seconds.
pub const DEFAULT_UPLOAD_INTERVAL_SECS: u64 = 60;

/// Remote key prefix for uploaded spill files.
pub const DEFAULT_UPLOAD_PREFIX: &str = "hashtag_data";

/// Local spill directory.
pub const DEFAULT_SPILL_ROOT: &str = "data";

/// Tags tracked when filtering is switched on without an explicit list.
pub const DEFAULT_TRACKED_TAGS: &[&str] = &[
    "rstats",
    "python",
    "stata",
    "sql",
    "html",
    "css",
    "javascript",
    "golang",
    "java",
    "csharp",
    "cplusplus",
    "trump",
    "loomer",
    "twitter",
    "musk",
    "elon",
];

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Firehose connection.
    pub stream: StreamConfig,
    /// In-memory buffer.
    pub buffer: BufferConfig,
    /// Local spill files.
    pub spill: SpillConfig,
    /// Bulk uploader.
    pub upload: UploadConfig,
    /// Remote object store.
    pub storage: StorageConfig,
    /// Optional tag allow-list.
    pub filter: FilterConfig,
    /// Prometheus endpoint.
    pub metrics: MetricsConfig,
}

impl IngestConfig {
    /// Load configuration from defaults, an optional TOML file and the environment.
    ///
    /// An explicitly given path must exist; the default `tagstream.toml` is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let toml = match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Toml::file_exact(path)
            }
            None => Toml::file(DEFAULT_CONFIG_FILE),
        };

        let config = Figment::from(Serialized::defaults(IngestConfig::default()))
            .merge(toml)
            .merge(
                Env::raw()
                    .only(&[AZURE_CONNECTION_STRING_ENV])
                    .map(|_| "storage.connection_string".into()),
            )
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Check required values and ranges.
    ///
    /// Fails on anything that would make the daemon useless or crash later:
    /// a missing storage credential, zero thresholds, a non-websocket endpoint.
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;

        if self.buffer.max_bytes == 0 || self.buffer.max_bytes > MAX_BUFFER_BYTES {
            return Err(Error::Config(format!(
                "buffer.max_bytes must be between 1 and {}",
                MAX_BUFFER_BYTES
            )));
        }
        if self.upload.interval_secs == 0 {
            return Err(Error::Config("upload.interval_secs must be > 0".to_string()));
        }
        if self.spill.root.as_os_str().is_empty() {
            return Err(Error::Config("spill.root must not be empty".to_string()));
        }

        self.storage.validate()?;
        self.filter.to_filter()?;
        Ok(())
    }
}

/// Firehose connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Jetstream subscribe URL (without the collection query).
    pub endpoint: String,
    /// Collection to subscribe to and accept.
    pub collection: String,
    /// Receive wait before looping again (seconds).
    pub idle_timeout_secs: u64,
    /// Connect attempt limit (seconds).
    pub connect_timeout_secs: u64,
    /// Delay after a closed connection (seconds).
    pub closed_backoff_secs: u64,
    /// Delay after any other error (seconds).
    pub error_backoff_secs: u64,
    /// Log progress every N tagged posts (0 disables).
    pub progress_interval: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_JETSTREAM_ENDPOINT.to_string(),
            collection: POST_COLLECTION.to_string(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            closed_backoff_secs: DEFAULT_CLOSED_BACKOFF_SECS,
            error_backoff_secs: DEFAULT_ERROR_BACKOFF_SECS,
            progress_interval: 1000,
        }
    }
}

impl StreamConfig {
    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| {
            Error::Config(format!("stream.endpoint '{}' is invalid: {}", self.endpoint, e))
        })?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::Config(format!(
                "stream.endpoint must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if self.collection.trim().is_empty() {
            return Err(Error::Config("stream.collection must not be empty".to_string()));
        }
        if self.idle_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "stream.idle_timeout_secs and stream.connect_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// In-memory buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Flush once the estimated size reaches this many bytes.
    pub max_bytes: usize,
    /// Log the buffer size at most this often (seconds, 0 disables).
    pub log_interval_secs: u64,
    /// Write whatever is buffered when shutting down.
    pub flush_on_shutdown: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BUFFER_BYTES,
            log_interval_secs: 5,
            flush_on_shutdown: true,
        }
    }
}

/// Spill file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpillLayout {
    /// One `data_<flush id>.parquet` per flush in the spill root.
    #[default]
    Flat,
    /// One file per tag per flush under `tag=<tag>/`.
    Partitioned,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression
    None,
    /// Snappy compression (fast, moderate ratio)
    #[default]
    Snappy,
    /// Zstd compression (slower, best ratio)
    Zstd,
}

impl Compression {
    /// Convert to parquet compression type
    pub fn to_parquet(self) -> parquet::basic::Compression {
        match self {
            Self::None => parquet::basic::Compression::UNCOMPRESSED,
            Self::Snappy => parquet::basic::Compression::SNAPPY,
            Self::Zstd => parquet::basic::Compression::ZSTD(Default::default()),
        }
    }
}

/// Local spill directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Root directory for spill files.
    pub root: PathBuf,
    /// Flat or tag-partitioned layout.
    pub layout: SpillLayout,
    /// Parquet codec.
    pub compression: Compression,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SPILL_ROOT),
            layout: SpillLayout::default(),
            compression: Compression::default(),
        }
    }
}

/// Bulk uploader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Seconds between scans of the spill directory.
    pub interval_secs: u64,
    /// Remote key prefix.
    pub prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_UPLOAD_INTERVAL_SECS,
            prefix: DEFAULT_UPLOAD_PREFIX.to_string(),
        }
    }
}

impl UploadConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Azure Blob Storage.
    Azure {
        /// Storage account name (optional when a connection string is given).
        #[serde(default)]
        account: String,
        /// Container name.
        #[serde(default)]
        container: String,
        /// Account key.
        #[serde(default)]
        access_key: Option<String>,
        /// Full connection string (`AccountName=..;AccountKey=..`).
        #[serde(default)]
        connection_string: Option<String>,
    },
    /// AWS S3 or S3-compatible storage.
    S3 {
        /// Bucket name.
        #[serde(default)]
        bucket: String,
        /// Region.
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint for S3-compatible services.
        #[serde(default)]
        endpoint: Option<String>,
        /// Access key ID (can also come from AWS_ACCESS_KEY_ID).
        #[serde(default)]
        access_key_id: Option<String>,
        /// Secret access key (can also come from AWS_SECRET_ACCESS_KEY).
        #[serde(default)]
        secret_access_key: Option<String>,
        /// Allow plain HTTP (local development).
        #[serde(default)]
        allow_http: bool,
    },
    /// Local filesystem, mostly for development.
    Local {
        /// Directory acting as the bucket.
        #[serde(default)]
        path: PathBuf,
    },
    /// In-memory storage (for testing).
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Azure {
            account: String::new(),
            container: String::new(),
            access_key: None,
            connection_string: None,
        }
    }
}

impl StorageConfig {
    /// Short backend name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Azure { .. } => "azure",
            Self::S3 { .. } => "s3",
            Self::Local { .. } => "local",
            Self::Memory => "memory",
        }
    }

    /// Check that the selected backend has what it needs to connect.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Azure {
                account,
                container,
                access_key,
                connection_string,
            } => {
                if container.trim().is_empty() {
                    return Err(Error::Config(
                        "storage.container is required for azure".to_string(),
                    ));
                }
                match connection_string {
                    Some(cs) if !cs.trim().is_empty() => {
                        crate::storage::AzureConnectionString::parse(cs)?;
                    }
                    _ => {
                        if account.trim().is_empty() || access_key.is_none() {
                            return Err(Error::Config(format!(
                                "azure storage needs storage.connection_string ({}) \
                                 or storage.account with storage.access_key",
                                AZURE_CONNECTION_STRING_ENV
                            )));
                        }
                    }
                }
            }
            Self::S3 { bucket, .. } => {
                if bucket.trim().is_empty() {
                    return Err(Error::Config("storage.bucket is required for s3".to_string()));
                }
            }
            Self::Local { path } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::Config("storage.path is required for local".to_string()));
                }
            }
            Self::Memory => {}
        }
        Ok(())
    }
}

/// Tag allow-list settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Keep only `tags` when true; keep every tag otherwise.
    pub enabled: bool,
    /// Tags to keep (normalized before matching).
    pub tags: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tags: DEFAULT_TRACKED_TAGS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl FilterConfig {
    /// Build the runtime filter.
    pub fn to_filter(&self) -> Result<TagFilter> {
        if !self.enabled {
            return Ok(TagFilter::all());
        }
        if self.tags.is_empty() {
            return Err(Error::Config(
                "filter.enabled is set but filter.tags is empty".to_string(),
            ));
        }
        Ok(TagFilter::only(&self.tags)?)
    }
}

/// Prometheus endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// HTTP port for `/metrics` (0 disables).
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}
