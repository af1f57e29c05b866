//! bucket-lsm: a per-bucket LSM write engine.
//!
//! Each (partition, bucket) owns its own [`levels::Levels`] and flushes
//! through a [`merge::writer::MergeTreeWriter`]; compaction is driven by a
//! pluggable [`compaction::universal::CompactStrategy`] and executed on a
//! [`compaction::manager::CompactExecutor`] shared across writers. Reads
//! during compaction and standalone table rewrites go through the same
//! [`merge::reader::MergeTreeReader`] k-way merge.
//!
//! [`coordinator::WriteCoordinator`] is the entry point: it opens a writer
//! restored from a [`manifest::SnapshotManager`], an empty writer for a new
//! table, or a one-shot [`coordinator::CompactWriter`] for bulk-load
//! finalization and manual compaction.

pub mod bloom;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod file_meta;
pub mod levels;
pub mod manifest;
pub mod merge;
pub mod path;
pub mod row;

pub use compaction::{CompactManager, CompactResult, CompactTask, CompactStrategy, CompactUnit, NoopCompactManager, UniversalCompaction};
pub use config::{ChangelogProducer, WriteEngineConfig};
pub use coordinator::{CompactWriter, WriteCoordinator};
pub use error::{Result, StorageError};
pub use file_meta::DataFileMeta;
pub use levels::{Levels, SortedRun};
pub use manifest::{CommitIncrement, InMemorySnapshotManager, ManifestEntry, SnapshotManager};
pub use merge::{InPlaceBuffer, MergeTreeReader, MergeTreeWriter, RunIterator, SpillableBuffer, WriteBuffer};
pub use path::{DefaultPathFactory, PathFactory};
pub use row::{BytesRow, KeyValue, LastValueWins, MergeFunction, SequenceNumber, ValueKind};
