use std::sync::Arc;

use tokio::sync::watch;

use batchembed_backend::FakeBackend;
use batchembed_cli::{completed_chunks, load_settings};
use batchembed_pipeline::Dispatcher;
use batchembed_store::verify::verify_consolidated;
use batchembed_store::Consolidator;

#[tokio::test]
async fn run_consolidate_verify() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    std::fs::write(
        root.join("config.toml"),
        r#"
[pipeline]
input_file = "input.jsonl"
shard_dir = "out/shards"
progress_dir = "out/progress"
chunk_size = 25
concurrency = 4

[backend]
endpoints = ["http://one/embed", "http://two/embed"]
model_id = "fake"
dim = 6

[consolidate]
shard_dir = "out/shards"
output_dir = "out/consolidated"
max_records_per_file = 100
row_group_size = 40
"#,
    )
    .unwrap();
    let lines: Vec<String> = (0..333)
        .map(|i| serde_json::json!({ "_id": { "$oid": format!("{i:024x}") }, "text": format!("sample {i}") }))
        .map(|v| v.to_string())
        .collect();
    std::fs::write(root.join("input.jsonl"), lines.join("\n")).unwrap();

    let s = load_settings(root).unwrap();
    assert!(completed_chunks(&s.pipeline, false, false).is_err());
    let (_tx, rx) = watch::channel(false);
    let summary = Dispatcher::new(s.pipeline.clone(), s.backend.clone(), Arc::new(FakeBackend::new(6)))
        .unwrap()
        .run(rx)
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!((summary.completed, summary.records), (14, 333));

    let done = completed_chunks(&s.pipeline, false, false).unwrap();
    assert_eq!(done, (0..14).collect());
    let report = Consolidator::new(s.consolidate.clone()).unwrap().with_done(done).run().unwrap();
    assert_eq!((report.shards, report.records), (14, 333));
    assert_eq!((report.parts, report.skipped_unmarked), (4, 0));

    let verified = verify_consolidated(&s.consolidate.output_dir).unwrap();
    assert_eq!(verified.total_records, 333);
    assert!(verified.parts.iter().all(|p| p.dim == Some(6)));
}
