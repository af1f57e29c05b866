//! Universal compaction strategy: selects which runs to compact, given
//! size-amplification and run-count triggers, evaluated in a fixed priority
//! order. Grounded on the size-ratio scan in
//! `other_examples/fjall-rs-lsm-tree::compaction::tiered::Strategy::choose`
//! (scanning from the newest run, extending a candidate prefix while the
//! next run's size stays within a ratio of the prefix sum), combined with
//! `motedb::storage::lsm::compaction::Level::needs_compaction`'s
//! threshold-trigger shape.

use crate::config::WriteEngineConfig;
use crate::levels::SortedRun;

/// A (outputLevel, list of runs to merge) pair, plus a flag for whether
/// DELETE tombstones may be discarded while merging.
pub struct CompactUnit<K> {
    pub output_level: usize,
    pub runs: Vec<(usize, SortedRun<K>)>,
    pub drop_delete: bool,
}

pub trait CompactStrategy<K>: Send + Sync {
    /// `runs` is ordered newest (L0 front) to oldest (highest level), each
    /// tagged with its current level.
    fn pick(
        &self,
        config: &WriteEngineConfig,
        runs: &[(usize, SortedRun<K>)],
    ) -> Option<CompactUnit<K>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UniversalCompaction;

impl<K: Clone> CompactStrategy<K> for UniversalCompaction {
    fn pick(
        &self,
        config: &WriteEngineConfig,
        runs: &[(usize, SortedRun<K>)],
    ) -> Option<CompactUnit<K>> {
        if runs.is_empty() {
            return None;
        }
        let top_level = config.num_levels - 1;

        if let Some(unit) = self.size_amplification_trigger(config, runs, top_level) {
            return Some(unit);
        }
        if let Some(unit) = self.size_ratio_trigger(config, runs, top_level) {
            return Some(unit);
        }
        if let Some(unit) = self.run_count_trigger(config, runs, top_level) {
            return Some(unit);
        }
        None
    }
}

impl UniversalCompaction {
    fn size_amplification_trigger<K: Clone>(
        &self,
        config: &WriteEngineConfig,
        runs: &[(usize, SortedRun<K>)],
        top_level: usize,
    ) -> Option<CompactUnit<K>> {
        if runs.len() < 2 {
            return None;
        }
        let oldest_size = runs.last().unwrap().1.total_size();
        let rest_size: u64 = runs[..runs.len() - 1].iter().map(|(_, r)| r.total_size()).sum();

        let triggered = if oldest_size == 0 {
            rest_size > 0
        } else {
            (rest_size as f64 / oldest_size as f64) * 100.0 >= config.max_size_amplification_percent as f64
        };

        if triggered {
            Some(CompactUnit { output_level: top_level, runs: runs.to_vec(), drop_delete: true })
        } else {
            None
        }
    }

    fn size_ratio_trigger<K: Clone>(
        &self,
        config: &WriteEngineConfig,
        runs: &[(usize, SortedRun<K>)],
        top_level: usize,
    ) -> Option<CompactUnit<K>> {
        let mut prefix: Vec<(usize, SortedRun<K>)> = vec![runs[0].clone()];
        let mut prefix_sum = runs[0].1.total_size();

        for run in &runs[1..] {
            let threshold = (1.0 + config.sorted_run_size_ratio as f64 / 100.0) * prefix_sum as f64;
            if (run.1.total_size() as f64) <= threshold {
                prefix_sum += run.1.total_size();
                prefix.push(run.clone());
            } else {
                break;
            }
        }

        if prefix.len() >= config.num_sorted_run_compaction_trigger {
            let output_level = prefix.iter().map(|(lvl, _)| *lvl).max().unwrap();
            Some(CompactUnit {
                output_level,
                runs: prefix,
                drop_delete: output_level == top_level,
            })
        } else {
            None
        }
    }

    fn run_count_trigger<K: Clone>(
        &self,
        config: &WriteEngineConfig,
        runs: &[(usize, SortedRun<K>)],
        top_level: usize,
    ) -> Option<CompactUnit<K>> {
        if runs.len() < config.max_sorted_run_num {
            return None;
        }
        let k = runs.len() - config.max_sorted_run_num + 1;
        let chosen: Vec<(usize, SortedRun<K>)> = runs[..k].to_vec();
        let output_level = chosen.iter().map(|(lvl, _)| *lvl).max().unwrap();
        Some(CompactUnit { output_level, runs: chosen, drop_delete: output_level == top_level })
    }
}
