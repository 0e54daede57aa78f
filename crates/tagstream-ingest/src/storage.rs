//! Object store factory and remote key construction.
//!
//! The uploader only ever sees an `Arc<dyn ObjectStore>`; which backend sits
//! behind it is decided here from [`StorageConfig`].
//!
//! Remote keys mirror the spill directory:
//!
//! ```text
//! {prefix}/data_1732000000000-000001.parquet
//! {prefix}/tag=rust/hashtag_data_20241119T100000Z_1732000000000-000002.parquet
//! ```

use crate::config::StorageConfig;
use crate::{Error, Result};
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::{Path as ObjectPath, PathPart};
use std::path::{Component, Path};
use std::sync::Arc;

/// Create an object store from configuration.
///
/// # Errors
///
/// Returns an error if the object store cannot be created (invalid path,
/// malformed connection string, missing credentials).
pub fn create_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Azure {
            account,
            container,
            access_key,
            connection_string,
        } => {
            let mut builder = MicrosoftAzureBuilder::new().with_container_name(container);

            match connection_string.as_deref().filter(|cs| !cs.trim().is_empty()) {
                Some(cs) => {
                    let parsed = AzureConnectionString::parse(cs)?;
                    if parsed.use_emulator {
                        builder = builder.with_use_emulator(true);
                    } else {
                        builder = builder.with_account(parsed.account_name);
                        if let Some(key) = parsed.account_key {
                            builder = builder.with_access_key(key);
                        }
                    }
                }
                None => {
                    builder = builder.with_account(account);
                    if let Some(key) = access_key {
                        builder = builder.with_access_key(key);
                    }
                }
            }

            Ok(Arc::new(builder.build()?))
        }
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            allow_http,
        } => {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

            if let Some(r) = region {
                builder = builder.with_region(r);
            }
            if let Some(ep) = endpoint {
                builder = builder.with_endpoint(ep);
            }
            if let Some(key) = access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }
            if *allow_http {
                builder = builder.with_allow_http(true);
            }

            Ok(Arc::new(builder.build()?))
        }
        StorageConfig::Local { path } => {
            std::fs::create_dir_all(path)?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        StorageConfig::Memory => Ok(Arc::new(InMemory::new())),
    }
}

/// The parts of an Azure storage connection string we use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConnectionString {
    pub account_name: String,
    pub account_key: Option<String>,
    pub use_emulator: bool,
}

impl AzureConnectionString {
    /// Parse `Key=Value;Key=Value` pairs. Keys are case-insensitive and
    /// values may contain `=` (base64 account keys do).
    pub fn parse(raw: &str) -> Result<Self> {
        let mut account_name = None;
        let mut account_key = None;
        let mut use_emulator = false;

        for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::Config(format!(
                    "malformed connection string segment '{}'",
                    pair
                )));
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "accountname" => account_name = Some(value.trim().to_string()),
                "accountkey" => account_key = Some(value.trim().to_string()),
                "usedevelopmentstorage" => use_emulator = value.trim().eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if use_emulator {
            return Ok(Self {
                account_name: account_name.unwrap_or_default(),
                account_key,
                use_emulator,
            });
        }

        match account_name {
            Some(account_name) if !account_name.is_empty() => Ok(Self {
                account_name,
                account_key,
                use_emulator,
            }),
            _ => Err(Error::Config(
                "connection string has no AccountName".to_string(),
            )),
        }
    }
}

/// Build the remote key for a spill file: `prefix` followed by the file's
/// path relative to the spill root, always `/`-separated.
pub fn remote_key(prefix: &str, relative: &Path) -> Result<ObjectPath> {
    let mut parts: Vec<PathPart<'static>> = prefix
        .split('/')
        .filter(|p| !p.is_empty())
        .map(|p| PathPart::from(p.to_string()))
        .collect();

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    Error::Spill(format!("non UTF-8 spill path: {}", relative.display()))
                })?;
                parts.push(PathPart::from(part.to_string()));
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::Spill(format!(
                    "spill path is not relative to the spill root: {}",
                    relative.display()
                )));
            }
        }
    }

    Ok(ObjectPath::from_iter(parts))
}
