//! Parquet spill files.
//!
//! A [`SpillWriter`] turns one buffer snapshot into one or more Parquet files
//! under the spill root. Two layouts are available:
//!
//! ```text
//! flat:         {root}/data_{flush_id}.parquet
//! partitioned:  {root}/tag={tag}/hashtag_data_{min_created_at}_{flush_id}.parquet
//! ```
//!
//! `flush_id` is `{unix_millis}-{sequence}`, so two flushes inside the same
//! millisecond still get distinct names.
//!
//! Distinct tags can sanitize to the same directory (`a/b` and `a_b`). The
//! second and later partitions of one flush that land in a shared directory
//! get `-{n}` appended to the flush id, so no file replaces another.
//!
//! Every file is written to `{final}.tmp` and renamed when complete. The
//! uploader skips `.tmp` files, so it never sees a half-written file. A
//! writer owns its spill root: leftover `.tmp` files from an earlier process
//! are removed when the writer is created.

use crate::config::{Compression, SpillConfig, SpillLayout};
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tagstream_core::TagMention;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Suffix of files still being written.
pub const IN_PROGRESS_EXTENSION: &str = "tmp";

/// Longest tag directory component we create (bytes).
const MAX_TAG_DIR_BYTES: usize = 128;

// =============================================================================
// Schema
// =============================================================================

/// Arrow schema of a spill file.
///
/// Column names are the ones downstream readers query: `created_at`, `cid`,
/// `did`, `hashtag`, `text`.
pub fn mention_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("created_at", DataType::Utf8, false),
        Field::new("cid", DataType::Utf8, false),
        Field::new("did", DataType::Utf8, false),
        Field::new("hashtag", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
    ]))
}

fn to_record_batch(records: &[&TagMention]) -> Result<RecordBatch> {
    let column = |f: fn(&TagMention) -> &str| -> ArrayRef {
        Arc::new(StringArray::from_iter_values(records.iter().map(|r| f(r))))
    };

    Ok(RecordBatch::try_new(
        mention_schema(),
        vec![
            column(|r| r.created_at.as_str()),
            column(|r| r.post_id.as_str()),
            column(|r| r.author_id.as_str()),
            column(|r| r.tag.as_str()),
            column(|r| r.text.as_str()),
        ],
    )?)
}

// =============================================================================
// Writer trait
// =============================================================================

/// A finished spill file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillFile {
    /// Final path (never a `.tmp` path).
    pub path: PathBuf,
    /// Rows in the file.
    pub record_count: usize,
    /// Partition tag, for the partitioned layout.
    pub tag: Option<String>,
    /// Size on disk.
    pub bytes: u64,
}

/// Serializes a buffer snapshot to spill files.
///
/// Called from the blocking pool; implementations do synchronous I/O.
pub trait SpillWriter: Send + Sync {
    /// Write `records` and return the files produced, in write order.
    ///
    /// An empty slice writes nothing. On error no complete file from this
    /// call is left behind.
    fn write(&self, records: &[TagMention]) -> Result<Vec<SpillFile>>;

    /// The spill root.
    fn root(&self) -> &Path;
}

/// Build the writer for the configured layout, creating the spill root.
pub fn build_writer(config: &SpillConfig) -> Result<Arc<dyn SpillWriter>> {
    Ok(match config.layout {
        SpillLayout::Flat => Arc::new(FlatWriter::new(&config.root, config.compression)?),
        SpillLayout::Partitioned => {
            Arc::new(PartitionedWriter::new(&config.root, config.compression)?)
        }
    })
}

/// Shared state of both layouts: root, codec and flush sequence.
#[derive(Debug)]
struct SpillDir {
    root: PathBuf,
    compression: Compression,
    sequence: AtomicU64,
}

impl SpillDir {
    fn new(root: &Path, compression: Compression) -> Result<Self> {
        fs::create_dir_all(root)?;
        let swept = sweep_in_progress(root)?;
        if swept > 0 {
            info!(
                "Removed {} unfinished spill file(s) under {}",
                swept,
                root.display()
            );
        }
        Ok(Self {
            root: root.to_path_buf(),
            compression,
            sequence: AtomicU64::new(0),
        })
    }

    fn next_flush_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:06}", Utc::now().timestamp_millis(), seq)
    }
}

// =============================================================================
// Flat layout
// =============================================================================

/// One file per flush directly in the spill root.
#[derive(Debug)]
pub struct FlatWriter {
    dir: SpillDir,
}

impl FlatWriter {
    pub fn new(root: &Path, compression: Compression) -> Result<Self> {
        Ok(Self {
            dir: SpillDir::new(root, compression)?,
        })
    }
}

impl SpillWriter for FlatWriter {
    fn write(&self, records: &[TagMention]) -> Result<Vec<SpillFile>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let path = self
            .dir
            .root
            .join(format!("data_{}.parquet", self.dir.next_flush_id()));
        let rows: Vec<&TagMention> = records.iter().collect();
        let bytes = write_parquet(&path, &rows, self.dir.compression)?;

        Ok(vec![SpillFile {
            path,
            record_count: rows.len(),
            tag: None,
            bytes,
        }])
    }

    fn root(&self) -> &Path {
        &self.dir.root
    }
}

// =============================================================================
// Partitioned layout
// =============================================================================

/// One file per distinct tag per flush, under `tag=<tag>/`.
#[derive(Debug)]
pub struct PartitionedWriter {
    dir: SpillDir,
}

impl PartitionedWriter {
    pub fn new(root: &Path, compression: Compression) -> Result<Self> {
        Ok(Self {
            dir: SpillDir::new(root, compression)?,
        })
    }
}

impl SpillWriter for PartitionedWriter {
    fn write(&self, records: &[TagMention]) -> Result<Vec<SpillFile>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // Relative order inside each partition follows the snapshot
        let mut partitions: BTreeMap<&str, Vec<&TagMention>> = BTreeMap::new();
        for record in records {
            partitions.entry(record.tag.as_str()).or_default().push(record);
        }

        let flush_id = self.dir.next_flush_id();
        let mut written: Vec<SpillFile> = Vec::with_capacity(partitions.len());
        let mut dir_uses: HashMap<String, usize> = HashMap::new();

        for (tag, rows) in partitions {
            let dir_name = sanitize_tag(tag);
            let uses = dir_uses.entry(dir_name.clone()).or_default();
            let file_id = match *uses {
                0 => flush_id.clone(),
                n => format!("{}-{}", flush_id, n),
            };
            *uses += 1;

            let timestamp = partition_timestamp(&rows).format("%Y%m%dT%H%M%SZ");
            let path = self
                .dir
                .root
                .join(format!("tag={}", dir_name))
                .join(format!("hashtag_data_{}_{}.parquet", timestamp, file_id));

            match write_parquet(&path, &rows, self.dir.compression) {
                Ok(bytes) => written.push(SpillFile {
                    path,
                    record_count: rows.len(),
                    tag: Some(tag.to_string()),
                    bytes,
                }),
                Err(e) => {
                    for file in &written {
                        if let Err(remove_err) = fs::remove_file(&file.path) {
                            warn!(
                                "Failed to remove partial flush file {}: {}",
                                file.path.display(),
                                remove_err
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(written)
    }

    fn root(&self) -> &Path {
        &self.dir.root
    }
}

/// Earliest parseable `created_at` of a partition, or now.
fn partition_timestamp(rows: &[&TagMention]) -> DateTime<Utc> {
    rows.iter()
        .filter_map(|r| DateTime::parse_from_rfc3339(&r.created_at).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .min()
        .unwrap_or_else(Utc::now)
}

/// Make a tag safe to use as a single directory name component.
pub fn sanitize_tag(tag: &str) -> String {
    let mut cleaned = String::with_capacity(tag.len());
    for c in tag.chars() {
        if cleaned.len() + c.len_utf8() > MAX_TAG_DIR_BYTES {
            break;
        }
        if c == '/' || c == '\\' || c.is_control() {
            cleaned.push('_');
        } else {
            cleaned.push(c);
        }
    }

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

// =============================================================================
// File I/O
// =============================================================================

/// Whether `path` is a spill file that is still being written.
pub fn is_in_progress(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == IN_PROGRESS_EXTENSION)
}

/// Delete `.tmp` files below `root`. Returns how many were removed.
fn sweep_in_progress(root: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && is_in_progress(entry.path()) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
        }
    }
    Ok(removed)
}

fn in_progress_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(IN_PROGRESS_EXTENSION);
    PathBuf::from(name)
}

/// Create `path`, recreating its parent once if it vanished in between
/// (the uploader prunes empty partition directories).
fn create_with_parent(path: &Path) -> Result<File> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Spill(format!("spill path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)?;

    match File::create(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(parent)?;
            Ok(File::create(path)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Write rows to `path` via a temporary file. Returns bytes on disk.
fn write_parquet(path: &Path, rows: &[&TagMention], compression: Compression) -> Result<u64> {
    let tmp = in_progress_path(path);

    let result = (|| -> Result<()> {
        let batch = to_record_batch(rows)?;
        let file = create_with_parent(&tmp)?;
        let props = WriterProperties::builder()
            .set_compression(compression.to_parquet())
            .build();

        let mut writer = ArrowWriter::try_new(file, mention_schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    let bytes = fs::metadata(path)?.len();
    debug!("Wrote {} rows to {} ({} bytes)", rows.len(), path.display(), bytes);
    Ok(bytes)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Spill(format!("{} has no utf8 column '{}'", path.display(), name)))
}

/// Read a spill file back into records.
pub fn read_spill_file(path: &Path) -> Result<Vec<TagMention>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let created_at = string_column(&batch, "created_at", path)?;
        let cid = string_column(&batch, "cid", path)?;
        let did = string_column(&batch, "did", path)?;
        let hashtag = string_column(&batch, "hashtag", path)?;
        let text = string_column(&batch, "text", path)?;

        for i in 0..batch.num_rows() {
            records.push(TagMention {
                created_at: created_at.value(i).to_string(),
                post_id: cid.value(i).to_string(),
                author_id: did.value(i).to_string(),
                tag: hashtag.value(i).to_string(),
                text: text.value(i).to_string(),
            });
        }
    }

    Ok(records)
}
