//! Tunables for the write engine, mirroring the teacher crate's `LSMConfig`
//! shape: one struct, a sane `Default`, and a handful of named presets.

/// Controls whether `MergeTreeReader` must emit a side stream of pre-merge
/// records during compaction for change-data-capture consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangelogProducer {
    #[default]
    None,
    Input,
    FullCompaction,
}

#[derive(Debug, Clone)]
pub struct WriteEngineConfig {
    /// Number of LSM levels, L0..L(numLevels-1).
    pub num_levels: usize,

    /// Rolling-writer rotation threshold, in bytes.
    pub target_file_size: u64,

    /// Whether the in-memory write buffer spills to disk when full.
    pub write_buffer_spillable: bool,

    /// Size of the in-memory write buffer before a flush is triggered.
    pub write_buffer_size: usize,

    /// Fan-in cap for the external-sort spill merge.
    pub local_sort_max_num_file_handles: usize,

    /// Size-amplification trigger threshold, as a percentage.
    pub max_size_amplification_percent: u64,

    /// Size-ratio trigger threshold, as a percentage.
    pub sorted_run_size_ratio: u64,

    /// Minimum prefix length for the size-ratio trigger to fire.
    pub num_sorted_run_compaction_trigger: usize,

    /// Run-count trigger threshold.
    pub max_sorted_run_num: usize,

    /// Write-path backpressure threshold: writes block once the number of
    /// L0 runs reaches this count.
    pub num_sorted_run_stop_trigger: usize,

    /// If true, `prepareCommit` joins any pending compaction before
    /// returning.
    pub commit_force_compact: bool,

    /// Controls whether compaction emits a changelog side stream.
    pub changelog_producer: ChangelogProducer,

    /// If true, writers use `NoopCompactManager` and never compact.
    pub write_compaction_skip: bool,

    /// Expected number of rows per file, used to size each file's bloom
    /// filter. Not part of the distilled spec's knob list but required to
    /// size the filter the rolling writer attaches to every output file.
    pub bloom_filter_bits_per_key: usize,
}

impl Default for WriteEngineConfig {
    fn default() -> Self {
        Self {
            num_levels: 5,
            target_file_size: 64 * 1024 * 1024,
            write_buffer_spillable: false,
            write_buffer_size: 64 * 1024 * 1024,
            local_sort_max_num_file_handles: 32,
            max_size_amplification_percent: 200,
            sorted_run_size_ratio: 1,
            num_sorted_run_compaction_trigger: 5,
            max_sorted_run_num: 5,
            num_sorted_run_stop_trigger: 10,
            commit_force_compact: false,
            changelog_producer: ChangelogProducer::None,
            write_compaction_skip: false,
            bloom_filter_bits_per_key: 10,
        }
    }
}

impl WriteEngineConfig {
    /// Bulk-load preset: skip background compaction entirely and let a
    /// standalone compact writer rewrite the table later.
    pub fn bulk_load() -> Self {
        Self {
            write_compaction_skip: true,
            write_buffer_spillable: true,
            num_sorted_run_stop_trigger: usize::MAX,
            ..Self::default()
        }
    }

    /// Read-optimized preset: compact aggressively to keep the number of
    /// sorted runs small at the cost of write amplification.
    pub fn read_optimized() -> Self {
        Self {
            max_sorted_run_num: 3,
            num_sorted_run_compaction_trigger: 3,
            num_sorted_run_stop_trigger: 6,
            ..Self::default()
        }
    }

    /// Write-optimized preset: tolerate more sorted runs before compacting,
    /// trading read amplification for write throughput.
    pub fn write_optimized() -> Self {
        Self {
            max_sorted_run_num: 8,
            num_sorted_run_compaction_trigger: 8,
            num_sorted_run_stop_trigger: 16,
            write_buffer_size: 128 * 1024 * 1024,
            ..Self::default()
        }
    }
}
