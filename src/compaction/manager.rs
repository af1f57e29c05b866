//! CompactManager / CompactTask: schedules and executes compactions on a
//! background executor, applies results atomically.
//!
//! The background worker pool is grounded on `motedb`'s `thread::spawn` +
//! channel-drain pattern in `LSMEngine::new_internal` (one long-lived
//! worker, parked between triggers), adapted to a shared job queue rather
//! than a dedicated thread per writer, matching the open question in the
//! distilled spec that assumes a shared `compactExecutor`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::codec::{BincodeRecordReader, RollingWriter};
use crate::config::WriteEngineConfig;
use crate::error::{Result, StorageError};
use crate::file_meta::DataFileMeta;
use crate::levels::{Levels, SortedRun};
use crate::merge::reader::{MergeTreeReader, RunIterator};
use crate::path::PathFactory;
use crate::row::{KeyValue, MergeFunction};

use super::universal::{CompactStrategy, CompactUnit};

/// The before/after file sets produced by one compaction.
#[derive(Debug, Clone)]
pub struct CompactResult<K> {
    pub before: Vec<DataFileMeta<K>>,
    pub after: Vec<DataFileMeta<K>>,
}

/// Shared background worker pool. Jobs are boxed closures so the pool
/// itself carries no type parameters and can be reused across writers of
/// different (K, V) pairs.
pub struct CompactExecutor {
    sender: Sender<Box<dyn FnOnce() + Send + 'static>>,
}

impl CompactExecutor {
    pub fn new(num_workers: usize) -> Arc<Self> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Box<dyn FnOnce() + Send + 'static>>();
        for _ in 0..num_workers.max(1) {
            let receiver: Receiver<Box<dyn FnOnce() + Send + 'static>> = receiver.clone();
            std::thread::spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            });
        }
        Arc::new(Self { sender })
    }

    fn submit(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        let _ = self.sender.send(job);
    }
}

/// Schedules and executes compactions for one writer. At most one
/// compaction is in flight at a time.
pub trait CompactManager<K, V>: Send + Sync {
    /// Asks the strategy for a unit and submits a `CompactTask` if one is
    /// idle and the strategy returns work. Surfaces any error from a
    /// previously-failed task before doing anything else.
    fn trigger_compaction(&self, levels: &Arc<RwLock<Levels<K>>>) -> Result<()>;

    fn has_pending(&self) -> bool;

    /// Drains completed results so the caller can apply them to `Levels`
    /// and fold them into the next commit delta.
    fn drain_completed(&self) -> Vec<CompactResult<K>>;

    /// Blocks until no compaction is in flight.
    fn wait_for_completion(&self);

    /// Cancels any pending compaction (used when closing a writer).
    fn cancel(&self);
}

/// A drop-in that never compacts, used when `writeCompactionSkip` is set.
/// It still accepts L0 appends — those go straight through `Levels`,
/// bypassing the manager entirely.
pub struct NoopCompactManager;

impl<K: Send + Sync, V: Send + Sync> CompactManager<K, V> for NoopCompactManager {
    fn trigger_compaction(&self, _levels: &Arc<RwLock<Levels<K>>>) -> Result<()> {
        Ok(())
    }

    fn has_pending(&self) -> bool {
        false
    }

    fn drain_completed(&self) -> Vec<CompactResult<K>> {
        Vec::new()
    }

    fn wait_for_completion(&self) {}

    fn cancel(&self) {}
}

pub struct DefaultCompactManager<K, V> {
    config: WriteEngineConfig,
    strategy: Box<dyn CompactStrategy<K>>,
    merge_fn: Box<dyn MergeFunction<K, V>>,
    path_factory: Arc<dyn PathFactory>,
    partition: String,
    bucket: u32,
    executor: Arc<CompactExecutor>,
    in_flight: Arc<AtomicBool>,
    result_tx: Sender<Result<CompactResult<K>>>,
    result_rx: Receiver<Result<CompactResult<K>>>,
    last_error: Mutex<Option<StorageError>>,
}

impl<K, V> DefaultCompactManager<K, V>
where
    K: Ord + Clone + Send + Sync + Serialize + DeserializeOwned + AsRef<[u8]> + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        config: WriteEngineConfig,
        strategy: Box<dyn CompactStrategy<K>>,
        merge_fn: Box<dyn MergeFunction<K, V>>,
        path_factory: Arc<dyn PathFactory>,
        partition: String,
        bucket: u32,
        executor: Arc<CompactExecutor>,
    ) -> Self {
        let (result_tx, result_rx) = crossbeam::channel::unbounded();
        Self {
            config,
            strategy,
            merge_fn,
            path_factory,
            partition,
            bucket,
            executor,
            in_flight: Arc::new(AtomicBool::new(false)),
            result_tx,
            result_rx,
            last_error: Mutex::new(None),
        }
    }
}

impl<K, V> CompactManager<K, V> for DefaultCompactManager<K, V>
where
    K: Ord + Clone + Send + Sync + Serialize + DeserializeOwned + AsRef<[u8]> + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    #[instrument(skip_all, fields(partition = %self.partition, bucket = self.bucket))]
    fn trigger_compaction(&self, levels: &Arc<RwLock<Levels<K>>>) -> Result<()> {
        if let Some(err) = self.last_error.lock().take() {
            return Err(err);
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let runs_snapshot: Vec<(usize, SortedRun<K>)> = {
            let guard = levels.read();
            guard.level_sorted_runs().into_iter().map(|(l, r)| (l, r.clone())).collect()
        };

        let unit = self.strategy.pick(&self.config, &runs_snapshot);
        let Some(unit) = unit else {
            self.in_flight.store(false, Ordering::Release);
            return Ok(());
        };

        debug!(runs = unit.runs.len(), output_level = unit.output_level, "submitting compaction task");

        let output_level = unit.output_level;
        let task = CompactTask {
            unit,
            merge_fn: self.merge_fn.clone_box(),
            path_factory: self.path_factory.clone(),
            partition: self.partition.clone(),
            bucket: self.bucket,
            output_level,
            target_file_size: self.config.target_file_size,
            bits_per_key: self.config.bloom_filter_bits_per_key,
        };

        let in_flight = self.in_flight.clone();
        let tx = self.result_tx.clone();
        self.executor.submit(Box::new(move || {
            let result = task.run();
            if let Err(ref e) = result {
                warn!(error = %e, "compaction task failed");
            }
            let _ = tx.send(result);
            in_flight.store(false, Ordering::Release);
        }));
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn drain_completed(&self) -> Vec<CompactResult<K>> {
        let mut out = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            match result {
                Ok(r) => out.push(r),
                Err(e) => {
                    *self.last_error.lock() = Some(e);
                    break;
                }
            }
        }
        out
    }

    fn wait_for_completion(&self) {
        while self.in_flight.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    fn cancel(&self) {
        // Jobs already submitted to the shared executor run to completion;
        // cancellation here means the caller stops waiting and discards
        // whatever result eventually arrives. Closing the writer drops
        // `result_rx`'s owner, and partial output files are cleaned up by
        // `CompactTask::run`'s own abort path on failure.
    }
}

/// Given a CompactUnit, partitions its input runs into maximal sections of
/// overlapping runs, drives a MergeTreeReader through a rolling writer for
/// the output level, and produces new DataFileMetas.
pub struct CompactTask<K, V> {
    unit: CompactUnit<K>,
    merge_fn: Box<dyn MergeFunction<K, V>>,
    path_factory: Arc<dyn PathFactory>,
    partition: String,
    bucket: u32,
    output_level: usize,
    target_file_size: u64,
    bits_per_key: usize,
}

impl<K, V> CompactTask<K, V>
where
    K: Ord + Clone + Send + Sync + Serialize + DeserializeOwned + AsRef<[u8]> + 'static,
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Used directly by the standalone compact writer, which runs a task
    /// synchronously rather than submitting it to a `CompactExecutor`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        unit: CompactUnit<K>,
        merge_fn: Box<dyn MergeFunction<K, V>>,
        path_factory: Arc<dyn PathFactory>,
        partition: String,
        bucket: u32,
        output_level: usize,
        target_file_size: u64,
        bits_per_key: usize,
    ) -> Self {
        Self { unit, merge_fn, path_factory, partition, bucket, output_level, target_file_size, bits_per_key }
    }

    pub fn run(self) -> Result<CompactResult<K>> {
        let before: Vec<DataFileMeta<K>> =
            self.unit.runs.iter().flat_map(|(_, run)| run.files.iter().cloned()).collect();

        let sections = partition_into_sections(self.unit.runs.clone());
        let mut writer = RollingWriter::<K, V>::new(
            self.path_factory.as_ref(),
            self.partition.clone(),
            self.bucket,
            self.output_level,
            self.target_file_size,
            self.bits_per_key,
        );

        for section in sections {
            if let Err(e) = self.process_section(&mut writer, section) {
                writer.abort();
                return Err(e);
            }
        }

        let after = writer.finish()?;
        Ok(CompactResult { before, after })
    }

    fn process_section(
        &self,
        writer: &mut RollingWriter<K, V>,
        section: Vec<(usize, SortedRun<K>)>,
    ) -> Result<()> {
        // A section with exactly one run has no duplicate keys to merge, so
        // it can stream straight through without a merge pass. Dropping
        // obsolete tombstones still applies, since that's a property of the
        // output level rather than of the merge itself.
        if section.len() == 1 {
            let (_, run) = &section[0];
            for file in &run.files {
                let reader: BincodeRecordReader<K, V> = BincodeRecordReader::open(Path::new(&file.file_name))?;
                for record in reader {
                    let record = record?;
                    if self.unit.drop_delete && record.is_delete() {
                        continue;
                    }
                    writer.write(record)?;
                }
            }
            return Ok(());
        }

        let sources: Vec<RunIterator<K, V>> = section
            .into_iter()
            .map(|(_, run)| -> RunIterator<K, V> {
                let files = run.files;
                Box::new(files.into_iter().flat_map(|f| {
                    match BincodeRecordReader::<K, V>::open(Path::new(&f.file_name)) {
                        Ok(reader) => {
                            Box::new(reader) as Box<dyn Iterator<Item = Result<KeyValue<K, V>>> + Send>
                        }
                        Err(e) => Box::new(std::iter::once(Err(e)))
                            as Box<dyn Iterator<Item = Result<KeyValue<K, V>>> + Send>,
                    }
                }))
            })
            .collect();

        let reader = MergeTreeReader::new(vec![sources], self.merge_fn.clone_box(), self.unit.drop_delete);
        for record in reader {
            writer.write(record?)?;
        }
        Ok(())
    }
}

/// Groups runs whose key ranges transitively overlap into maximal
/// sections; sections themselves are disjoint and ordered by key range.
fn partition_into_sections<K: Ord + Clone>(
    mut runs: Vec<(usize, SortedRun<K>)>,
) -> Vec<Vec<(usize, SortedRun<K>)>> {
    runs.retain(|(_, run)| !run.is_empty());
    runs.sort_by(|a, b| a.1.files[0].min_key.cmp(&b.1.files[0].min_key));

    let mut sections: Vec<Vec<(usize, SortedRun<K>)>> = Vec::new();
    let mut current: Vec<(usize, SortedRun<K>)> = Vec::new();
    let mut current_max: Option<K> = None;

    for run in runs {
        let run_min = run.1.files.first().unwrap().min_key.clone();
        let run_max = run.1.files.last().unwrap().max_key.clone();
        match &current_max {
            Some(max) if run_min <= *max => {
                if run_max > *max {
                    current_max = Some(run_max);
                }
                current.push(run);
            }
            _ => {
                if !current.is_empty() {
                    sections.push(std::mem::take(&mut current));
                }
                current_max = Some(run_max);
                current.push(run);
            }
        }
    }
    if !current.is_empty() {
        sections.push(current);
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(level: usize, name: &str, min: i32, max: i32) -> (usize, SortedRun<i32>) {
        let meta = DataFileMeta {
            file_name: name.to_string(),
            min_key: min,
            max_key: max,
            min_sequence: 0,
            max_sequence: 0,
            row_count: 1,
            file_size: 1,
            level,
            bloom_filter: Vec::new(),
        };
        (level, SortedRun::new(vec![meta]))
    }

    #[test]
    fn overlapping_runs_form_one_section() {
        let runs = vec![run(0, "a", 1, 5), run(0, "b", 4, 8), run(1, "c", 20, 30)];
        let sections = partition_into_sections(runs);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].len(), 2);
        assert_eq!(sections[1].len(), 1);
    }

    #[test]
    fn disjoint_runs_form_separate_sections() {
        let runs = vec![run(0, "a", 1, 2), run(0, "b", 10, 20)];
        let sections = partition_into_sections(runs);
        assert_eq!(sections.len(), 2);
    }
}
