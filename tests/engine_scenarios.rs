//! End-to-end scenarios spanning the write buffer, levels, compaction
//! trigger selection, and the standalone compact writer.

use std::path::Path;
use std::sync::Arc;

use bucket_lsm::codec::{BincodeRecordReader, BincodeRecordWriter};
use bucket_lsm::compaction::manager::CompactExecutor;
use bucket_lsm::manifest::ManifestEntry;
use bucket_lsm::path::DefaultPathFactory;
use bucket_lsm::{
    BytesRow, CompactUnit, DataFileMeta, InMemorySnapshotManager, KeyValue, LastValueWins,
    SortedRun, ValueKind, WriteCoordinator, WriteEngineConfig,
};

fn seed_file(dir: &Path, name: &str, level: usize, keys: &[&str]) -> DataFileMeta<BytesRow> {
    let path = dir.join(name);
    let mut writer: BincodeRecordWriter<BytesRow, BytesRow> = BincodeRecordWriter::create(&path).unwrap();
    for (i, key) in keys.iter().enumerate() {
        writer.push(KeyValue::add(BytesRow::from(*key), i as u64, BytesRow::from(format!("v-{key}")))).unwrap();
    }
    let file_size = writer.finish(&[]).unwrap();
    DataFileMeta {
        file_name: path.to_string_lossy().into_owned(),
        min_key: BytesRow::from(keys[0]),
        max_key: BytesRow::from(keys[keys.len() - 1]),
        min_sequence: 0,
        max_sequence: keys.len() as u64 - 1,
        row_count: keys.len() as u64,
        file_size,
        level,
        bloom_filter: Vec::new(),
    }
}

fn read_back(path: &str) -> Vec<KeyValue<BytesRow, BytesRow>> {
    let reader: BincodeRecordReader<BytesRow, BytesRow> = BincodeRecordReader::open(Path::new(path)).unwrap();
    reader.map(|r| r.unwrap()).collect()
}

fn coordinator(
    dir: &Path,
    config: WriteEngineConfig,
) -> (WriteCoordinator<BytesRow, BytesRow>, Arc<InMemorySnapshotManager<BytesRow>>) {
    let snapshot_manager = Arc::new(InMemorySnapshotManager::new());
    let coordinator = WriteCoordinator::new(
        config,
        Box::new(LastValueWins),
        Arc::new(DefaultPathFactory::new(dir)),
        snapshot_manager.clone(),
        CompactExecutor::new(2),
    );
    (coordinator, snapshot_manager)
}

/// A later write to the same key wins over an earlier one, surviving a
/// flush to L0.
#[test]
fn simple_upsert_keeps_last_write() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _snapshot) = coordinator(dir.path(), WriteEngineConfig::default());

    let mut writer = coordinator.create_empty_writer("orders", 0).unwrap();
    writer.write(KeyValue::add(BytesRow::from("k1"), 0, BytesRow::from("first"))).unwrap();
    writer.write(KeyValue::add(BytesRow::from("k1"), 0, BytesRow::from("second"))).unwrap();
    let delta = writer.prepare_commit(false).unwrap();

    assert_eq!(delta.new_files.len(), 1);
    let records = read_back(&delta.new_files[0].file_name);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value.0, b"second");
}

/// A DELETE tombstone survives a non-top-level compaction (so lower levels
/// still see it) but is dropped once compacted into the top level.
#[test]
fn delete_tombstone_dropped_only_at_top_level() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("with_delete.data");
    let mut writer: BincodeRecordWriter<BytesRow, BytesRow> = BincodeRecordWriter::create(&path).unwrap();
    writer.push(KeyValue::delete(BytesRow::from("k"), 1, BytesRow::from(""))).unwrap();
    let file_size = writer.finish(&[]).unwrap();
    let meta = DataFileMeta {
        file_name: path.to_string_lossy().into_owned(),
        min_key: BytesRow::from("k"),
        max_key: BytesRow::from("k"),
        min_sequence: 1,
        max_sequence: 1,
        row_count: 1,
        file_size,
        level: 1,
        bloom_filter: Vec::new(),
    };

    let run_task = |drop_delete: bool, output_level: usize, out_name: &str| {
        let unit = CompactUnit {
            output_level,
            runs: vec![(1, SortedRun::new(vec![meta.clone()]))],
            drop_delete,
        };
        let task = bucket_lsm::CompactTask::new(
            unit,
            Box::new(LastValueWins),
            Arc::new(DefaultPathFactory::new(dir.path().join(out_name))),
            "p0".to_string(),
            0,
            output_level,
            u64::MAX,
            10,
        );
        task.run().unwrap()
    };

    let kept = run_task(false, 1, "intermediate");
    let kept_records = read_back(&kept.after[0].file_name);
    assert_eq!(kept_records.len(), 1);
    assert_eq!(kept_records[0].kind, ValueKind::Delete);

    let dropped = run_task(true, 4, "top");
    assert!(dropped.after.is_empty(), "a lone tombstone compacted at the top level produces no output file");
}

/// `writeCompactionSkip` leaves every flush as its own L0 run and never
/// invokes the compaction strategy.
#[test]
fn bulk_load_skip_produces_one_run_per_flush() {
    let dir = tempfile::tempdir().unwrap();
    let config = WriteEngineConfig::bulk_load();
    let (coordinator, _snapshot) = coordinator(dir.path(), config);

    let mut writer = coordinator.create_empty_writer("bulk", 0).unwrap();
    for i in 0..10u32 {
        writer.write(KeyValue::add(BytesRow::from(format!("k{i:03}")), 0, BytesRow::from("v"))).unwrap();
        writer.flush().unwrap();
    }

    let levels = writer.levels();
    let guard = levels.read();
    let l0_runs = guard.level_sorted_runs().iter().filter(|(l, _)| *l == 0).count();
    assert_eq!(l0_runs, 10);
}

/// Restoring a writer from a manifest snapshot with files already spread
/// across levels, then flushing and triggering compaction, produces output
/// at or above the level the oldest input file already occupied.
#[test]
fn restore_then_compact_lands_at_or_above_existing_level() {
    let dir = tempfile::tempdir().unwrap();
    let a = seed_file(dir.path(), "a.data", 0, &["k1", "k2"]);
    let b = seed_file(dir.path(), "b.data", 0, &["k4", "k5"]);
    let c = seed_file(dir.path(), "c.data", 2, &["k1", "k2", "k3", "k4", "k5"]);

    let config = WriteEngineConfig { max_size_amplification_percent: 10, ..Default::default() };
    let (coordinator, snapshot) = coordinator(dir.path(), config);
    snapshot.seed(
        "p0",
        0,
        vec![
            ManifestEntry { file: a, level: 0 },
            ManifestEntry { file: b, level: 0 },
            ManifestEntry { file: c, level: 2 },
        ],
    );

    let mut writer = coordinator.create_writer("p0", 0).unwrap();
    assert_eq!(writer.levels().read().all_files().len(), 3);

    writer.write(KeyValue::add(BytesRow::from("k9"), 0, BytesRow::from("new"))).unwrap();
    let delta = writer.prepare_commit(true).unwrap();

    assert!(!delta.compacted_after.is_empty(), "size-amplification trigger should have fired");
    for file in &delta.compacted_after {
        assert!(file.level >= 2, "compaction must not regress below the level already reached");
    }
    writer.levels().read().check_invariants().unwrap();
}

/// An empty-buffer commit is a true no-op: zero new files, zero compacted
/// files, and no error.
#[test]
fn empty_commit_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (coordinator, _snapshot) = coordinator(dir.path(), WriteEngineConfig::default());
    let mut writer = coordinator.create_empty_writer("p0", 0).unwrap();
    let delta = writer.prepare_commit(true).unwrap();
    assert!(delta.is_empty());
}
