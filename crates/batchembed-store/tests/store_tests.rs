use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use batchembed_core::config::ConsolidateSettings;
use batchembed_core::types::EmbeddingResult;
use batchembed_store::consolidate::{part_file_name, MANIFEST_FILE};
use batchembed_store::verify::{inspect_file, verify_consolidated};
use batchembed_store::{list_shards, read_shard, Consolidator, Manifest, ShardRow, ShardWriter, StoreError};

const DIM: usize = 4;

fn results(chunk: u64, n: usize) -> Vec<EmbeddingResult> {
    (0..n)
        .map(|i| EmbeddingResult {
            id: format!("rec-{chunk}-{i}"),
            vector: vec![chunk as f32, i as f32, 0.5, -1.0],
            model_id: "test-model".into(),
        })
        .collect()
}

fn write_shards(dir: &Path, shards: u64, per_shard: usize) {
    let writer = ShardWriter::new(dir, "test-model", DIM).unwrap();
    for c in 0..shards {
        writer.write_chunk(c, &results(c, per_shard)).unwrap();
    }
}

fn settings(root: &Path, cap: usize) -> ConsolidateSettings {
    ConsolidateSettings {
        shard_dir: root.join("shards"),
        output_dir: root.join("consolidated"),
        max_records_per_file: cap,
        row_group_size: 10_000,
        delete_sources: false,
    }
}

#[test]
fn shard_roundtrip_preserves_order_and_leaves_no_temporaries() {
    let tmp = tempfile::tempdir().unwrap();
    let writer = ShardWriter::new(tmp.path(), "test-model", DIM).unwrap();
    let input = results(5, 7);
    let name = writer.write_chunk(5, &input).unwrap();
    assert_eq!(name, "shard-000000000005-000000000005.parquet");

    let contents = read_shard(&tmp.path().join(&name)).unwrap();
    assert_eq!(contents.meta.model_id, "test-model");
    assert_eq!(contents.meta.dim, DIM);
    assert_eq!((contents.meta.first_chunk, contents.meta.last_chunk), (5, 5));
    let back: Vec<EmbeddingResult> = contents.rows.iter().map(|r| r.result.clone()).collect();
    assert_eq!(back, input);
    assert!(contents.rows.iter().all(|r| r.chunk_id == 5));

    // Redo after a crash simply replaces the shard.
    writer.write_chunk(5, &input).unwrap();
    assert_eq!(list_shards(tmp.path()).unwrap().len(), 1);
    assert_eq!(fs::read_dir(tmp.path().join(".tmp")).unwrap().count(), 0);
    assert_eq!(writer.cleanup_staging().unwrap(), 0);
}

#[test]
fn thousand_shards_consolidate_into_two_parts() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = settings(tmp.path(), 50_000);
    write_shards(&cfg.shard_dir, 1000, 100);

    let report = Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    assert_eq!(report.shards, 1000);
    assert_eq!(report.parts, 2);
    assert_eq!(report.records, 100_000);

    let verified = verify_consolidated(&cfg.output_dir).unwrap();
    assert_eq!(verified.total_records, 100_000);
    assert_eq!(verified.parts.len(), 2);
    for part in &verified.parts {
        assert_eq!(part.rows, 50_000);
        assert_eq!(part.model_id.as_deref(), Some("test-model"));
        assert!(part.row_groups >= 5);
    }

    let first = Manifest::load(&cfg.output_dir).unwrap();
    let again = Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    assert_eq!(again.parts, 2);
    assert_eq!(again.stale_parts_removed, 0);
    let second = Manifest::load(&cfg.output_dir).unwrap();
    assert_eq!(first.parts, second.parts);
    assert_eq!(list_shards(&cfg.shard_dir).unwrap().len(), 1000);
}

#[test]
fn consolidated_rows_match_shards_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = settings(tmp.path(), 25);
    write_shards(&cfg.shard_dir, 6, 10);
    Consolidator::new(cfg.clone()).unwrap().run().unwrap();

    let manifest = Manifest::load(&cfg.output_dir).unwrap();
    assert_eq!(manifest.parts.len(), 3);
    let mut ids = HashSet::new();
    for part in &manifest.parts {
        let contents = read_shard(&cfg.output_dir.join(&part.file)).unwrap();
        for ShardRow { chunk_id, result } in contents.rows {
            assert_eq!(result.vector[0], chunk_id as f32);
            assert!(ids.insert(result.id));
        }
    }
    assert_eq!(ids.len(), 60);
}

#[test]
fn shrinking_output_removes_stale_parts_and_sources_when_asked() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), 20);
    write_shards(&cfg.shard_dir, 4, 10);
    assert_eq!(Consolidator::new(cfg.clone()).unwrap().run().unwrap().parts, 2);

    cfg.max_records_per_file = 1000;
    cfg.delete_sources = true;
    let report = Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    assert_eq!(report.parts, 1);
    assert_eq!(report.stale_parts_removed, 1);
    assert_eq!(report.sources_deleted, 4);
    assert!(!cfg.output_dir.join(part_file_name(1)).exists());
    assert!(list_shards(&cfg.shard_dir).unwrap().is_empty());
    assert_eq!(inspect_file(&cfg.output_dir.join(part_file_name(0)), true).unwrap().duplicate_ids, Some(0));

    // Nothing left to do; previous output stays.
    let noop = Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    assert_eq!((noop.shards, noop.parts, noop.carried_parts, noop.records), (0, 1, 1, 40));
    assert_eq!(Manifest::load(&cfg.output_dir).unwrap().total_records, 40);
}

#[test]
fn overlapping_ranges_abort_before_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = settings(tmp.path(), 1000);
    let writer = ShardWriter::new(&cfg.shard_dir, "test-model", DIM).unwrap();
    let rows = |c: u64| -> Vec<ShardRow> {
        results(c, 2).into_iter().map(|result| ShardRow { chunk_id: c, result }).collect()
    };
    writer.write_rows(0, 1, &[rows(0), rows(1)].concat()).unwrap();
    writer.write_chunk(1, &results(100, 2)).unwrap();

    let err = Consolidator::new(cfg.clone()).unwrap().run().unwrap_err();
    assert!(err.is_integrity(), "{err}");
    assert!(!cfg.output_dir.join(MANIFEST_FILE).exists());
    assert!(!cfg.output_dir.join(part_file_name(0)).exists());
}

#[test]
fn duplicate_ids_across_shards_abort() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = settings(tmp.path(), 1000);
    let writer = ShardWriter::new(&cfg.shard_dir, "test-model", DIM).unwrap();
    writer.write_chunk(0, &results(7, 3)).unwrap();
    writer.write_chunk(1, &results(7, 3)).unwrap();
    let err = Consolidator::new(cfg).unwrap().run().unwrap_err();
    assert!(matches!(err, StoreError::Integrity(ref m) if m.contains("rec-7-0")), "{err}");
}

#[test]
fn output_dir_must_differ_from_shard_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), 10);
    cfg.output_dir = cfg.shard_dir.clone();
    assert!(matches!(Consolidator::new(cfg), Err(StoreError::InvalidConfig(_))));
}

#[test]
fn shards_added_after_sources_were_deleted_extend_the_output() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), 1000);
    cfg.delete_sources = true;
    write_shards(&cfg.shard_dir, 5, 10);
    let first = Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    assert_eq!((first.parts, first.records, first.sources_deleted), (1, 50, 5));
    let part0 = fs::read(cfg.output_dir.join(part_file_name(0))).unwrap();

    let writer = ShardWriter::new(&cfg.shard_dir, "test-model", DIM).unwrap();
    writer.write_chunk(7, &results(7, 10)).unwrap();
    let second = Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    assert_eq!((second.shards, second.parts, second.carried_parts), (1, 2, 1));
    assert_eq!(second.records, 60);
    assert_eq!(second.stale_parts_removed, 0);

    assert_eq!(fs::read(cfg.output_dir.join(part_file_name(0))).unwrap(), part0);
    let manifest = Manifest::load(&cfg.output_dir).unwrap();
    let files: Vec<&str> = manifest.parts.iter().map(|p| p.file.as_str()).collect();
    assert_eq!(files, [part_file_name(0), part_file_name(1)]);
    assert_eq!(manifest.parts[1].sources, ["shard-000000000007-000000000007.parquet"]);
    assert_eq!(verify_consolidated(&cfg.output_dir).unwrap().total_records, 60);
    assert!(list_shards(&cfg.shard_dir).unwrap().is_empty());
}

#[test]
fn interrupted_source_deletion_is_finished_on_the_next_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), 20);
    write_shards(&cfg.shard_dir, 4, 10);
    Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    // Crash after removing the first source of part 0.
    fs::remove_file(&list_shards(&cfg.shard_dir).unwrap()[0].path).unwrap();

    cfg.delete_sources = true;
    let report = Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    assert_eq!((report.shards, report.carried_parts, report.parts), (2, 1, 2));
    assert_eq!(report.records, 40);
    assert_eq!(report.sources_deleted, 3);
    assert_eq!(verify_consolidated(&cfg.output_dir).unwrap().total_records, 40);
}

#[test]
fn new_shard_overlapping_consolidated_chunks_aborts() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), 1000);
    cfg.delete_sources = true;
    write_shards(&cfg.shard_dir, 3, 5);
    Consolidator::new(cfg.clone()).unwrap().run().unwrap();

    let writer = ShardWriter::new(&cfg.shard_dir, "test-model", DIM).unwrap();
    let rows: Vec<ShardRow> = (2..5)
        .flat_map(|c| results(100 + c, 2).into_iter().map(move |result| ShardRow { chunk_id: c, result }))
        .collect();
    writer.write_rows(2, 4, &rows).unwrap();
    let err = Consolidator::new(cfg.clone()).unwrap().run().unwrap_err();
    assert!(err.is_integrity(), "{err}");
    assert!(!cfg.output_dir.join(part_file_name(1)).exists());
}

#[test]
fn lost_part_with_deleted_sources_is_an_integrity_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), 1000);
    cfg.delete_sources = true;
    write_shards(&cfg.shard_dir, 2, 5);
    Consolidator::new(cfg.clone()).unwrap().run().unwrap();
    fs::remove_file(cfg.output_dir.join(part_file_name(0))).unwrap();

    let err = Consolidator::new(cfg).unwrap().run().unwrap_err();
    assert!(matches!(err, StoreError::Integrity(ref m) if m.contains(&part_file_name(0))), "{err}");
}

#[test]
fn shards_without_ledger_markers_are_left_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), 1000);
    cfg.delete_sources = true;
    write_shards(&cfg.shard_dir, 4, 10);

    let done: BTreeSet<u64> = [0, 1, 3].into();
    let report = Consolidator::new(cfg.clone()).unwrap().with_done(done).run().unwrap();
    assert_eq!((report.shards, report.records, report.skipped_unmarked), (3, 30, 1));
    let left: Vec<u64> = list_shards(&cfg.shard_dir).unwrap().iter().map(|s| s.first_chunk).collect();
    assert_eq!(left, [2]);

    let report = Consolidator::new(cfg.clone()).unwrap().with_done((0..4).collect()).run().unwrap();
    assert_eq!((report.shards, report.parts, report.records), (1, 2, 40));
    assert_eq!(verify_consolidated(&cfg.output_dir).unwrap().total_records, 40);
}
