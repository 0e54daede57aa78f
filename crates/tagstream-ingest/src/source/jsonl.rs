//! JSONL replay source.
//!
//! Reads captured firehose frames from JSONL files (one Jetstream envelope
//! per line, optionally gzip-compressed) and feeds them through the same
//! pipeline as the live connector.

use super::SourceStats;
use crate::pipeline::MentionPipeline;
use crate::{Error, Result};
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Configuration for the JSONL source.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Input file or directory path.
    pub input: PathBuf,

    /// Limit number of files to process (for testing).
    pub limit: Option<usize>,

    /// Progress reporting interval (lines).
    pub progress_interval: u64,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            limit: None,
            progress_interval: 100_000,
        }
    }
}

/// JSONL file frame source.
pub struct JsonlSource {
    config: JsonlConfig,
}

impl JsonlSource {
    /// Create a new JSONL source with the given configuration.
    pub fn new(config: JsonlConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    /// Collect files to process based on input path.
    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let input = &self.config.input;
        let mut files = Vec::new();

        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            let mut entries: Vec<_> = fs::read_dir(input)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|path| {
                    path.is_file()
                        && path.extension().is_some_and(|ext| {
                            ext == "jsonl" || ext == "json" || ext == "ndjson" || ext == "gz"
                        })
                })
                .collect();

            // Sort for deterministic processing order
            entries.sort();
            files = entries;
        } else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Input path does not exist: {}", input.display()),
            )));
        }

        if let Some(limit) = self.config.limit {
            files.truncate(limit);
        }

        Ok(files)
    }

    fn open(path: &Path) -> Result<Box<dyn BufRead + Send>> {
        let file = File::open(path)?;
        if path.extension().is_some_and(|ext| ext == "gz") {
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// Feed every line of every input file to `pipeline`.
    ///
    /// Stops early (without error) when `cancel` fires. Malformed lines are
    /// counted by the pipeline, unreadable lines end the file with a warning.
    pub async fn run(
        &self,
        pipeline: &mut MentionPipeline,
        cancel: &CancellationToken,
    ) -> Result<SourceStats> {
        let files = self.collect_files()?;
        tracing::info!("Found {} JSONL files to replay", files.len());

        let mut stats = SourceStats::default();

        'files: for (file_idx, path) in files.iter().enumerate() {
            tracing::info!(
                "[{}/{}] Replaying: {}",
                file_idx + 1,
                files.len(),
                path.display()
            );

            let reader = Self::open(path)?;
            for (line_num, line) in reader.lines().enumerate() {
                if cancel.is_cancelled() {
                    tracing::info!("Replay cancelled");
                    break 'files;
                }

                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("{}:{}: read error: {}", path.display(), line_num + 1, e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                stats.frames += 1;
                pipeline.handle_frame(line.as_bytes()).await;

                if self.config.progress_interval > 0
                    && stats.frames.is_multiple_of(self.config.progress_interval)
                {
                    tracing::info!(
                        "Progress: {} lines, {} mentions buffered",
                        stats.frames,
                        pipeline.stats().mentions
                    );
                }
            }

            stats.files_processed += 1;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::pipeline::{FlatWriter, TagBuffer};
    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;
    use tagstream_core::{POST_COLLECTION, TAG_FEATURE_TYPE, TagFilter};
    use tempfile::TempDir;

    fn line(cid: &str, tag: &str) -> String {
        json!({
            "did": "did:plc:author",
            "kind": "commit",
            "commit": {
                "collection": POST_COLLECTION,
                "cid": cid,
                "record": { "text": "x", "facets": [ { "features": [ { "$type": TAG_FEATURE_TYPE, "tag": tag } ] } ] }
            }
        })
        .to_string()
    }

    fn pipeline(spill: &Path) -> MentionPipeline {
        let writer = Arc::new(FlatWriter::new(spill, Compression::Snappy).unwrap());
        MentionPipeline::new(
            TagBuffer::new(usize::MAX, writer),
            POST_COLLECTION,
            TagFilter::all(),
        )
    }

    #[tokio::test]
    async fn test_replays_plain_and_gzip_files() {
        let input = TempDir::new().unwrap();
        let spill = TempDir::new().unwrap();

        let plain = format!("{}\n\nnot json\n{}\n", line("a", "go"), line("b", "rust"));
        fs::write(input.path().join("a.jsonl"), plain).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        writeln!(encoder, "{}", line("c", "sql")).unwrap();
        fs::write(input.path().join("b.jsonl.gz"), encoder.finish().unwrap()).unwrap();
        fs::write(input.path().join("ignored.txt"), "nope").unwrap();

        let mut pipeline = pipeline(spill.path());
        let source = JsonlSource::new(JsonlConfig {
            input: input.path().to_path_buf(),
            ..Default::default()
        });
        let stats = source
            .run(&mut pipeline, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.files_processed, 2);
        assert_eq!(stats.frames, 4);
        assert_eq!(pipeline.stats().malformed, 1);

        let post_ids: Vec<&str> = pipeline
            .buffer()
            .records()
            .iter()
            .map(|r| r.post_id.as_str())
            .collect();
        assert_eq!(post_ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let spill = TempDir::new().unwrap();
        let mut pipeline = pipeline(spill.path());
        let source = JsonlSource::new(JsonlConfig {
            input: spill.path().join("missing.jsonl"),
            ..Default::default()
        });

        let result = source.run(&mut pipeline, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_cancelled_replay_stops() {
        let input = TempDir::new().unwrap();
        let spill = TempDir::new().unwrap();
        fs::write(input.path().join("a.jsonl"), line("a", "go")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut pipeline = pipeline(spill.path());
        let source = JsonlSource::new(JsonlConfig {
            input: input.path().join("a.jsonl"),
            ..Default::default()
        });
        let stats = source.run(&mut pipeline, &cancel).await.unwrap();

        assert_eq!(stats.frames, 0);
        assert!(pipeline.buffer().is_empty());
    }
}
