//! Entry points for opening writers against a (partition, bucket): restore
//! from the manifest, start empty, or one-shot rewrite for bulk load /
//! manual compaction. Grounded on
//! `motedb::storage::lsm::engine::LSMEngine`'s constructor split between a
//! fresh engine and one restored from on-disk state.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::compaction::manager::{CompactExecutor, CompactManager, CompactTask, DefaultCompactManager, NoopCompactManager};
use crate::compaction::universal::{CompactUnit, UniversalCompaction};
use crate::config::WriteEngineConfig;
use crate::error::Result;
use crate::file_meta::DataFileMeta;
use crate::levels::{Levels, SortedRun};
use crate::manifest::{CommitIncrement, SnapshotManager};
use crate::merge::writer::{InPlaceBuffer, MergeTreeWriter, SpillableBuffer, WriteBuffer};
use crate::path::PathFactory;
use crate::row::MergeFunction;

/// Shared, reusable factory for writers over one table. One coordinator
/// typically serves many (partition, bucket) pairs, all sharing the same
/// `CompactExecutor` per the assumption that background compaction runs on
/// a pool shared across writers rather than a thread per writer.
pub struct WriteCoordinator<K, V> {
    config: WriteEngineConfig,
    merge_fn: Box<dyn MergeFunction<K, V>>,
    path_factory: Arc<dyn PathFactory>,
    snapshot_manager: Arc<dyn SnapshotManager<K>>,
    executor: Arc<CompactExecutor>,
}

impl<K, V> WriteCoordinator<K, V>
where
    K: Ord + Clone + Send + Sync + Serialize + DeserializeOwned + AsRef<[u8]> + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + AsRef<[u8]> + 'static,
{
    pub fn new(
        config: WriteEngineConfig,
        merge_fn: Box<dyn MergeFunction<K, V>>,
        path_factory: Arc<dyn PathFactory>,
        snapshot_manager: Arc<dyn SnapshotManager<K>>,
        executor: Arc<CompactExecutor>,
    ) -> Self {
        Self { config, merge_fn, path_factory, snapshot_manager, executor }
    }

    fn make_buffer(&self) -> Result<Box<dyn WriteBuffer<K, V>>> {
        if self.config.write_buffer_spillable {
            // A spill chunk has to be a fraction of the overall write buffer,
            // not the whole thing, or the first spill alone already reaches
            // write_buffer_size and forces a flush before a second run ever
            // accumulates - local_sort_max_num_file_handles' fan-in cap would
            // then never have more than one run to reduce.
            let max_fan_in = self.config.local_sort_max_num_file_handles.max(1);
            let chunk_byte_limit = (self.config.write_buffer_size / (max_fan_in * 4)).max(4096);
            Ok(Box::new(SpillableBuffer::new(
                self.merge_fn.clone_box(),
                chunk_byte_limit,
                max_fan_in,
            )?))
        } else {
            Ok(Box::new(InPlaceBuffer::new(self.merge_fn.clone_box())))
        }
    }

    fn make_compact_manager(&self, partition: &str, bucket: u32) -> Arc<dyn CompactManager<K, V>> {
        if self.config.write_compaction_skip {
            Arc::new(NoopCompactManager)
        } else {
            Arc::new(DefaultCompactManager::new(
                self.config.clone(),
                Box::new(UniversalCompaction),
                self.merge_fn.clone_box(),
                self.path_factory.clone(),
                partition.to_string(),
                bucket,
                self.executor.clone(),
            ))
        }
    }

    fn committed_files(&self, partition: &str, bucket: u32) -> Vec<DataFileMeta<K>> {
        let snapshot_id = self.snapshot_manager.latest_snapshot_id(partition, bucket).unwrap_or(0);
        self.snapshot_manager
            .scan(partition, bucket, snapshot_id)
            .into_iter()
            .map(|entry| entry.file)
            .collect()
    }

    /// Restores `Levels` from the manifest's latest snapshot for this
    /// (partition, bucket) and opens a writer against it.
    #[instrument(skip(self))]
    pub fn create_writer(&self, partition: &str, bucket: u32) -> Result<MergeTreeWriter<K, V>> {
        let files = self.committed_files(partition, bucket);
        let levels = Arc::new(RwLock::new(Levels::restore(self.config.num_levels, files)?));
        Ok(MergeTreeWriter::new(
            partition,
            bucket,
            self.config.clone(),
            self.make_buffer()?,
            levels,
            self.make_compact_manager(partition, bucket),
            self.path_factory.clone(),
        ))
    }

    /// Opens a writer with no prior state, ignoring anything already
    /// committed for this (partition, bucket). Used for a brand-new table.
    #[instrument(skip(self))]
    pub fn create_empty_writer(&self, partition: &str, bucket: u32) -> Result<MergeTreeWriter<K, V>> {
        let levels = Arc::new(RwLock::new(Levels::new(self.config.num_levels)));
        Ok(MergeTreeWriter::new(
            partition,
            bucket,
            self.config.clone(),
            self.make_buffer()?,
            levels,
            self.make_compact_manager(partition, bucket),
            self.path_factory.clone(),
        ))
    }

    /// Builds a one-shot writer that rewrites `files` (or, if `None`,
    /// everything currently committed for this bucket) into a single run
    /// at the top level, dropping DELETE tombstones. Used for bulk-load
    /// finalization and manual full-table compaction; runs synchronously
    /// on the caller's thread rather than going through the background
    /// executor.
    #[instrument(skip(self, files))]
    pub fn create_compact_writer(
        &self,
        partition: &str,
        bucket: u32,
        files: Option<Vec<DataFileMeta<K>>>,
    ) -> Result<CompactWriter<K, V>> {
        let files = files.unwrap_or_else(|| self.committed_files(partition, bucket));
        let top_level = self.config.num_levels - 1;
        let runs = group_files_into_runs(files);

        let unit = CompactUnit { output_level: top_level, runs, drop_delete: true };
        let task = CompactTask::new(
            unit,
            self.merge_fn.clone_box(),
            self.path_factory.clone(),
            partition.to_string(),
            bucket,
            top_level,
            self.config.target_file_size,
            self.config.bloom_filter_bits_per_key,
        );
        Ok(CompactWriter { task })
    }
}

/// Groups files by their stored level: L0 files each become a one-file
/// run (preserving their possible overlap), files at level >= 1 are
/// already non-overlapping within a level and collapse into a single run.
fn group_files_into_runs<K: Ord + Clone>(files: Vec<DataFileMeta<K>>) -> Vec<(usize, SortedRun<K>)> {
    let mut by_level: std::collections::BTreeMap<usize, Vec<DataFileMeta<K>>> = std::collections::BTreeMap::new();
    for f in files {
        by_level.entry(f.level).or_default().push(f);
    }
    let mut runs = Vec::new();
    for (level, files) in by_level {
        if level == 0 {
            for f in files {
                runs.push((0, SortedRun::new(vec![f])));
            }
        } else {
            runs.push((level, SortedRun::new(files)));
        }
    }
    runs
}

/// A one-shot, synchronous rewrite, holding no state on `Levels` — the
/// caller commits the returned increment through whatever manifest service
/// backs `SnapshotManager`.
pub struct CompactWriter<K, V> {
    task: CompactTask<K, V>,
}

impl<K, V> CompactWriter<K, V>
where
    K: Ord + Clone + Send + Sync + Serialize + DeserializeOwned + AsRef<[u8]> + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn compact(self) -> Result<CommitIncrement<K>> {
        let result = self.task.run()?;
        Ok(CommitIncrement {
            new_files: Vec::new(),
            compacted_before: result.before,
            compacted_after: result.after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::InMemorySnapshotManager;
    use crate::path::DefaultPathFactory;
    use crate::row::{BytesRow, KeyValue, LastValueWins};

    fn coordinator(
        dir: &std::path::Path,
        config: WriteEngineConfig,
    ) -> (WriteCoordinator<BytesRow, BytesRow>, Arc<InMemorySnapshotManager<BytesRow>>) {
        let snapshot_manager = Arc::new(InMemorySnapshotManager::new());
        let coordinator = WriteCoordinator::new(
            config,
            Box::new(LastValueWins),
            Arc::new(DefaultPathFactory::new(dir)),
            snapshot_manager.clone(),
            CompactExecutor::new(1),
        );
        (coordinator, snapshot_manager)
    }

    #[test]
    fn empty_writer_then_commit_round_trips_through_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, snapshot) = coordinator(dir.path(), WriteEngineConfig::default());

        let mut writer = coordinator.create_empty_writer("p0", 0).unwrap();
        writer.write(KeyValue::add(BytesRow::from("a"), 0, BytesRow::from("1"))).unwrap();
        let delta = writer.prepare_commit(true).unwrap();
        assert_eq!(delta.new_files.len(), 1);
        snapshot.commit("p0", 0, delta);

        let reopened = coordinator.create_writer("p0", 0).unwrap();
        assert_eq!(reopened.levels().read().all_files().len(), 1);
    }

    #[test]
    fn compact_writer_rewrites_everything_into_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = WriteEngineConfig { write_compaction_skip: true, ..Default::default() };
        let (coordinator, snapshot) = coordinator(dir.path(), config);

        let mut writer = coordinator.create_empty_writer("p0", 0).unwrap();
        for i in 0..3u32 {
            writer.write(KeyValue::add(BytesRow::from(format!("k{i}")), 0, BytesRow::from("v"))).unwrap();
            writer.flush().unwrap();
        }
        let delta = writer.prepare_commit(false).unwrap();
        snapshot.commit("p0", 0, delta);

        let top_level = coordinator.config.num_levels - 1;
        let compactor = coordinator.create_compact_writer("p0", 0, None).unwrap();
        let increment = compactor.compact().unwrap();
        assert_eq!(increment.compacted_after.len(), 1);
        assert_eq!(increment.compacted_after[0].level, top_level);
    }
}
