//! End-to-end tests: frames in, spill files on disk, objects in the store.

use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tagstream_core::{POST_COLLECTION, RawMessage, TAG_FEATURE_TYPE, TagFilter, extract_mentions};
use tagstream_ingest::config::Compression;
use tagstream_ingest::pipeline::read_spill_file;
use tagstream_ingest::upload::scan_spill_files;
use tagstream_ingest::{
    BulkUploader, FlatWriter, MentionPipeline, PartitionedWriter, SpillWriter, TagBuffer,
};
use tempfile::TempDir;

fn post(cid: &str, tag: &str, created_at: &str) -> String {
    json!({
        "did": format!("did:plc:{}", cid),
        "time_us": 1_732_000_000_000_000u64,
        "kind": "commit",
        "commit": {
            "operation": "create",
            "collection": POST_COLLECTION,
            "cid": cid,
            "record": {
                "createdAt": created_at,
                "text": format!("post {} about #{}", cid, tag),
                "facets": [ { "features": [ { "$type": TAG_FEATURE_TYPE, "tag": tag } ] } ]
            }
        }
    })
    .to_string()
}

fn size_of_frame(frame: &str) -> usize {
    let message = RawMessage::from_slice(frame.as_bytes()).unwrap();
    extract_mentions(&message, POST_COLLECTION, &TagFilter::all())
        .iter()
        .map(|m| m.estimated_size())
        .sum()
}

#[tokio::test]
async fn test_threshold_flush_writes_first_two_records() {
    let spill = TempDir::new().unwrap();
    let frames = [
        post("c1", "go", "2024-11-19T10:00:00Z"),
        post("c2", "go", "2024-11-19T10:00:01Z"),
        post("c3", "rust", "2024-11-19T10:00:02Z"),
    ];

    // The second record reaches the threshold, the third stays buffered
    let threshold = size_of_frame(&frames[0]) + size_of_frame(&frames[1]);
    assert!(size_of_frame(&frames[2]) < threshold);

    let writer = Arc::new(FlatWriter::new(spill.path(), Compression::Snappy).unwrap());
    let mut pipeline = MentionPipeline::new(
        TagBuffer::new(threshold, writer),
        POST_COLLECTION,
        TagFilter::all(),
    );

    for frame in &frames {
        pipeline.handle_frame(frame.as_bytes()).await;
    }

    let files = scan_spill_files(spill.path()).unwrap();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("data_") && name.ends_with(".parquet"));

    let written = read_spill_file(&files[0]).unwrap();
    let cids: Vec<&str> = written.iter().map(|m| m.post_id.as_str()).collect();
    assert_eq!(cids, vec!["c1", "c2"]);
    assert!(written.iter().all(|m| m.tag == "go"));
    assert_eq!(written[0].author_id, "did:plc:c1");
    assert_eq!(written[0].created_at, "2024-11-19T10:00:00Z");

    let buffered = pipeline.buffer().records();
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].tag, "rust");
    assert_eq!(pipeline.buffer().size_bytes(), size_of_frame(&frames[2]));
}

#[tokio::test]
async fn test_malformed_and_untagged_frames_are_skipped() {
    let spill = TempDir::new().unwrap();
    let writer = Arc::new(FlatWriter::new(spill.path(), Compression::None).unwrap());
    let mut pipeline = MentionPipeline::new(
        TagBuffer::new(usize::MAX, writer),
        POST_COLLECTION,
        TagFilter::all(),
    );

    let identity = json!({ "did": "did:plc:x", "kind": "identity" }).to_string();
    let like = json!({
        "did": "did:plc:x",
        "kind": "commit",
        "commit": { "collection": "app.bsky.feed.like", "cid": "l1" }
    })
    .to_string();

    assert_eq!(pipeline.handle_frame(b"{ not json").await, 0);
    assert_eq!(pipeline.handle_frame(identity.as_bytes()).await, 0);
    assert_eq!(pipeline.handle_frame(like.as_bytes()).await, 0);
    assert_eq!(
        pipeline
            .handle_frame(post("c1", "  Rust ", "2024-11-19T10:00:00Z").as_bytes())
            .await,
        1
    );

    assert_eq!(pipeline.stats().messages, 4);
    assert_eq!(pipeline.stats().malformed, 1);
    assert_eq!(pipeline.buffer().records()[0].tag, "rust");

    let files = pipeline.flush().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].record_count, 1);
    assert!(pipeline.buffer().is_empty());
}

#[tokio::test]
async fn test_partitioned_spill_files_are_uploaded_and_removed() {
    let spill = TempDir::new().unwrap();
    let writer = PartitionedWriter::new(spill.path(), Compression::Zstd).unwrap();

    let mut records = Vec::new();
    for (cid, tag) in [("a", "go"), ("b", "rust"), ("c", "go"), ("d", "sql")] {
        let frame = post(cid, tag, "2024-11-19T10:00:00Z");
        let message = RawMessage::from_slice(frame.as_bytes()).unwrap();
        records.extend(extract_mentions(&message, POST_COLLECTION, &TagFilter::all()));
    }
    let written = writer.write(&records).unwrap();
    assert_eq!(written.len(), 3);

    let store = Arc::new(InMemory::new());
    let uploader = BulkUploader::new(
        store.clone(),
        spill.path(),
        "hashtag_data",
        Duration::from_secs(60),
    );
    let report = uploader.run_once().await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.uploaded, 3);
    assert_eq!(report.failed, 0);
    assert!(scan_spill_files(spill.path()).unwrap().is_empty());
    // Partition directories are pruned, the root stays
    assert!(spill.path().exists());
    assert!(!spill.path().join("tag=go").exists());

    let objects: Vec<_> = store
        .list(Some(&ObjectPath::from("hashtag_data")))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(objects.len(), 3);
    let mut keys: Vec<String> = objects.iter().map(|o| o.location.to_string()).collect();
    keys.sort();
    assert!(keys[0].starts_with("hashtag_data/tag=go/hashtag_data_20241119T100000Z_"));
    assert!(keys[1].starts_with("hashtag_data/tag=rust/"));
    assert!(keys[2].starts_with("hashtag_data/tag=sql/"));

    let go_file = written.iter().find(|f| f.tag.as_deref() == Some("go")).unwrap();
    assert_eq!(go_file.record_count, 2);
    assert_eq!(
        objects
            .iter()
            .find(|o| o.location.to_string() == keys[0])
            .unwrap()
            .size,
        go_file.bytes
    );
}
