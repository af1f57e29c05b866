//! Snapshot/manifest service: out of scope as an external collaborator,
//! modeled as a trait plus an in-memory reference implementation used by
//! tests and by `createCompactWriter` when no explicit file list is given.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::file_meta::DataFileMeta;

/// A manifest-scan result: a file plus the level it currently resides in.
#[derive(Debug, Clone)]
pub struct ManifestEntry<K> {
    pub file: DataFileMeta<K>,
    pub level: usize,
}

/// The triple handed to the manifest service at commit time.
#[derive(Debug, Clone, Default)]
pub struct CommitIncrement<K> {
    pub new_files: Vec<DataFileMeta<K>>,
    pub compacted_before: Vec<DataFileMeta<K>>,
    pub compacted_after: Vec<DataFileMeta<K>>,
}

impl<K> CommitIncrement<K> {
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.compacted_before.is_empty() && self.compacted_after.is_empty()
    }
}

pub trait SnapshotManager<K>: Send + Sync {
    fn latest_snapshot_id(&self, partition: &str, bucket: u32) -> Option<u64>;

    /// Files committed for (partition, bucket) as of `snapshot_id`.
    fn scan(&self, partition: &str, bucket: u32, snapshot_id: u64) -> Vec<ManifestEntry<K>>;

    /// Commits a delta as a new snapshot, returning its id.
    fn commit(&self, partition: &str, bucket: u32, delta: CommitIncrement<K>) -> u64;
}

#[derive(Clone)]
struct BucketState<K> {
    snapshot_id: u64,
    files: Vec<ManifestEntry<K>>,
}

/// An in-process reference manifest, sufficient for tests and for driving
/// the standalone compact writer without a real manifest service attached.
pub struct InMemorySnapshotManager<K> {
    state: RwLock<HashMap<(String, u32), BucketState<K>>>,
}

impl<K> Default for InMemorySnapshotManager<K> {
    fn default() -> Self {
        Self { state: RwLock::new(HashMap::new()) }
    }
}

impl<K: Clone> InMemorySnapshotManager<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the manifest with an initial committed file list, as if a
    /// prior writer had already run. Used by restore-from-snapshot tests.
    pub fn seed(&self, partition: &str, bucket: u32, entries: Vec<ManifestEntry<K>>) {
        self.state.write().insert(
            (partition.to_string(), bucket),
            BucketState { snapshot_id: 1, files: entries },
        );
    }
}

impl<K: Clone + Send + Sync> SnapshotManager<K> for InMemorySnapshotManager<K> {
    fn latest_snapshot_id(&self, partition: &str, bucket: u32) -> Option<u64> {
        self.state.read().get(&(partition.to_string(), bucket)).map(|s| s.snapshot_id)
    }

    fn scan(&self, partition: &str, bucket: u32, snapshot_id: u64) -> Vec<ManifestEntry<K>> {
        self.state
            .read()
            .get(&(partition.to_string(), bucket))
            .filter(|s| s.snapshot_id == snapshot_id)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }

    fn commit(&self, partition: &str, bucket: u32, delta: CommitIncrement<K>) -> u64 {
        let key = (partition.to_string(), bucket);
        let mut state = self.state.write();
        let entry = state.entry(key).or_insert_with(|| BucketState { snapshot_id: 0, files: Vec::new() });

        let before_names: std::collections::HashSet<String> =
            delta.compacted_before.iter().map(|f| f.file_name.clone()).collect();
        entry.files.retain(|e| !before_names.contains(&e.file.file_name));

        for f in delta.new_files {
            let level = f.level;
            entry.files.push(ManifestEntry { file: f, level });
        }
        for f in delta.compacted_after {
            let level = f.level;
            entry.files.push(ManifestEntry { file: f, level });
        }
        entry.snapshot_id += 1;
        entry.snapshot_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::BytesRow;

    fn meta(name: &str) -> DataFileMeta<BytesRow> {
        DataFileMeta {
            file_name: name.to_string(),
            min_key: BytesRow::from("a"),
            max_key: BytesRow::from("z"),
            min_sequence: 0,
            max_sequence: 0,
            row_count: 1,
            file_size: 1,
            level: 0,
            bloom_filter: Vec::new(),
        }
    }

    #[test]
    fn commit_then_scan_round_trips() {
        let manager = InMemorySnapshotManager::new();
        let delta = CommitIncrement {
            new_files: vec![meta("a")],
            compacted_before: vec![],
            compacted_after: vec![],
        };
        let id = manager.commit("p0", 0, delta);
        let files = manager.scan("p0", 0, id);
        assert_eq!(files.len(), 1);
        assert_eq!(manager.latest_snapshot_id("p0", 0), Some(id));
    }
}
