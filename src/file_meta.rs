//! Immutable descriptor of a written data file, grounded on the shape of
//! `motedb::storage::lsm::compaction::SSTableMeta` but generalized from a
//! fixed `PathBuf` + `u64` key range to a generic row type.

use crate::bloom::BloomFilter;
use crate::row::SequenceNumber;

/// Immutable: file name, key range, sequence range, row count, size, level,
/// and the serialized bloom filter the rolling writer built while writing
/// the file (the same bytes persisted in the file's footer).
/// Cheap to copy/clone; `Levels` owns the authoritative set, compact tasks
/// only ever borrow read-only views of it.
#[derive(Debug, Clone)]
pub struct DataFileMeta<K> {
    pub file_name: String,
    pub min_key: K,
    pub max_key: K,
    pub min_sequence: SequenceNumber,
    pub max_sequence: SequenceNumber,
    pub row_count: u64,
    pub file_size: u64,
    pub level: usize,
    pub bloom_filter: Vec<u8>,
}

impl<K: Ord> DataFileMeta<K> {
    /// Two metas overlap iff their `[min_key, max_key]` ranges intersect
    /// under the key comparator.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min_key <= other.max_key && other.min_key <= self.max_key
    }

    /// Reconstructs the bloom filter from its serialized form. `None` if
    /// this meta was built before a bloom filter was ever attached (the
    /// empty byte case `BloomFilter::from_bytes_full` rejects).
    pub fn bloom_filter(&self) -> Option<BloomFilter> {
        BloomFilter::from_bytes_full(&self.bloom_filter)
    }
}
