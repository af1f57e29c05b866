//! Sorted run & Levels: grouping of files into levels, level invariants.
//!
//! Grounded on `motedb::storage::lsm::compaction::Level`'s sublevel
//! bookkeeping, generalized from "N tiered sublevels of SSTableMeta" to the
//! spec's L0-many-overlapping-runs / L1..Ln-one-run-each shape.

use crate::error::{Result, StorageError};
use crate::file_meta::DataFileMeta;

/// An ordered, non-overlapping sequence of files, sorted by `min_key`.
#[derive(Debug, Clone, Default)]
pub struct SortedRun<K> {
    pub files: Vec<DataFileMeta<K>>,
}

impl<K: Ord + Clone> SortedRun<K> {
    pub fn new(mut files: Vec<DataFileMeta<K>>) -> Self {
        files.sort_by(|a, b| a.min_key.cmp(&b.min_key));
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }

    fn is_non_overlapping(&self) -> bool {
        self.files.windows(2).all(|w| !w[0].overlaps(&w[1]))
    }
}

/// Fixed number of level slots, 0..N-1. Level 0 holds unsorted, possibly
/// overlapping runs (newest first, one file per run). Levels 1..N-1 each
/// hold exactly one `SortedRun` (possibly empty).
#[derive(Debug, Clone)]
pub struct Levels<K> {
    num_levels: usize,
    /// Newest first.
    l0_runs: Vec<SortedRun<K>>,
    /// Index 0 holds level 1, index `num_levels - 2` holds level `N - 1`.
    higher_levels: Vec<SortedRun<K>>,
}

impl<K: Ord + Clone> Levels<K> {
    pub fn new(num_levels: usize) -> Self {
        assert!(num_levels >= 2, "need at least L0 and one higher level");
        Self {
            num_levels,
            l0_runs: Vec::new(),
            higher_levels: (0..num_levels - 1).map(|_| SortedRun::default()).collect(),
        }
    }

    /// Restores from a committed file list, grouping files by their stored
    /// level.
    pub fn restore(num_levels: usize, files: Vec<DataFileMeta<K>>) -> Result<Self> {
        let mut levels = Self::new(num_levels);
        let mut by_level: Vec<Vec<DataFileMeta<K>>> = (0..num_levels).map(|_| Vec::new()).collect();
        for f in files {
            let level = f.level;
            if level >= num_levels {
                return Err(StorageError::InvalidData(format!(
                    "file {} claims level {} but only {} levels exist",
                    f.file_name, level, num_levels
                )));
            }
            by_level[level].push(f);
        }
        for f in by_level.remove(0) {
            levels.l0_runs.push(SortedRun::new(vec![f]));
        }
        for (idx, files) in by_level.into_iter().enumerate() {
            levels.higher_levels[idx] = SortedRun::new(files);
            if !levels.higher_levels[idx].is_non_overlapping() {
                return Err(StorageError::InvalidData(format!(
                    "level {} restored with overlapping files",
                    idx + 1
                )));
            }
        }
        Ok(levels)
    }

    pub fn number_of_levels(&self) -> usize {
        self.num_levels
    }

    /// Inserts `file` into the target level, maintaining key-order and
    /// non-overlap for level >= 1.
    pub fn add(&mut self, level: usize, file: DataFileMeta<K>) -> Result<()> {
        if level == 0 {
            self.l0_runs.insert(0, SortedRun::new(vec![file]));
            return Ok(());
        }
        let run = self.higher_level_mut(level)?;
        for existing in &run.files {
            if existing.overlaps(&file) {
                return Err(StorageError::InvalidData(format!(
                    "file {} overlaps existing file {} at level {}",
                    file.file_name, existing.file_name, level
                )));
            }
        }
        run.files.push(file);
        run.files.sort_by(|a, b| a.min_key.cmp(&b.min_key));
        Ok(())
    }

    /// Atomically removes `before` from wherever they reside and inserts
    /// `after` at `output_level` as a single new sorted run.
    pub fn update(
        &mut self,
        before: &[DataFileMeta<K>],
        after: Vec<DataFileMeta<K>>,
        output_level: usize,
    ) -> Result<()> {
        if output_level >= self.num_levels {
            return Err(StorageError::InvalidData(format!(
                "output level {} exceeds number of levels {}",
                output_level, self.num_levels
            )));
        }
        let before_names: std::collections::HashSet<&str> =
            before.iter().map(|f| f.file_name.as_str()).collect();

        self.l0_runs.retain(|run| {
            !run.files.iter().any(|f| before_names.contains(f.file_name.as_str()))
        });
        for run in self.higher_levels.iter_mut() {
            run.files.retain(|f| !before_names.contains(f.file_name.as_str()));
        }

        if output_level == 0 {
            for f in after {
                self.l0_runs.insert(0, SortedRun::new(vec![f]));
            }
        } else {
            let run = self.higher_level_mut(output_level)?;
            run.files.extend(after);
            run.files.sort_by(|a, b| a.min_key.cmp(&b.min_key));
            if !run.is_non_overlapping() {
                return Err(StorageError::InvalidData(format!(
                    "update produced overlapping files at level {}",
                    output_level
                )));
            }
        }
        Ok(())
    }

    /// Enumerates runs level-by-level, newest (L0 front) to oldest, for
    /// consumption by the compact strategy. Empty higher levels contribute
    /// no run.
    pub fn level_sorted_runs(&self) -> Vec<(usize, &SortedRun<K>)> {
        let mut runs: Vec<(usize, &SortedRun<K>)> = self.l0_runs.iter().map(|r| (0, r)).collect();
        for (idx, run) in self.higher_levels.iter().enumerate() {
            if !run.is_empty() {
                runs.push((idx + 1, run));
            }
        }
        runs
    }

    pub fn all_files(&self) -> Vec<DataFileMeta<K>> {
        let mut out = Vec::new();
        for run in &self.l0_runs {
            out.extend(run.files.iter().cloned());
        }
        for run in &self.higher_levels {
            out.extend(run.files.iter().cloned());
        }
        out
    }

    fn higher_level_mut(&mut self, level: usize) -> Result<&mut SortedRun<K>> {
        if level == 0 || level >= self.num_levels {
            return Err(StorageError::InvalidData(format!("level {} out of range", level)));
        }
        Ok(&mut self.higher_levels[level - 1])
    }

    /// Checks the invariants named in the spec: each level >= 1 has at most
    /// one run, non-overlapping within that run.
    pub fn check_invariants(&self) -> Result<()> {
        for (idx, run) in self.higher_levels.iter().enumerate() {
            if !run.is_non_overlapping() {
                return Err(StorageError::InvalidData(format!(
                    "level {} violates non-overlap invariant",
                    idx + 1
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, min: i32, max: i32, level: usize) -> DataFileMeta<i32> {
        DataFileMeta {
            file_name: name.to_string(),
            min_key: min,
            max_key: max,
            min_sequence: 0,
            max_sequence: 0,
            row_count: 1,
            file_size: 10,
            level,
            bloom_filter: Vec::new(),
        }
    }

    #[test]
    fn l0_add_keeps_newest_first_and_allows_overlap() {
        let mut levels = Levels::new(3);
        levels.add(0, meta("a", 1, 5, 0)).unwrap();
        levels.add(0, meta("b", 2, 6, 0)).unwrap();
        let runs = levels.level_sorted_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].1.files[0].file_name, "b");
        assert_eq!(runs[1].1.files[0].file_name, "a");
    }

    #[test]
    fn higher_level_add_rejects_overlap() {
        let mut levels = Levels::new(3);
        levels.add(1, meta("a", 1, 5, 1)).unwrap();
        let err = levels.add(1, meta("b", 3, 7, 1)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
    }

    #[test]
    fn update_replaces_inputs_with_outputs_atomically() {
        let mut levels = Levels::new(3);
        levels.add(0, meta("a", 1, 5, 0)).unwrap();
        levels.add(0, meta("b", 6, 10, 0)).unwrap();
        let before = levels.all_files();
        let merged = meta("c", 1, 10, 2);
        levels.update(&before, vec![merged], 2).unwrap();

        assert!(levels.level_sorted_runs().iter().all(|(lvl, _)| *lvl != 0));
        let runs = levels.level_sorted_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, 2);
        assert_eq!(runs[0].1.files[0].file_name, "c");
        levels.check_invariants().unwrap();
    }

    #[test]
    fn restore_groups_files_by_stored_level() {
        let files = vec![meta("a", 1, 2, 0), meta("b", 3, 4, 0), meta("c", 5, 6, 2)];
        let levels = Levels::restore(5, files).unwrap();
        assert_eq!(levels.level_sorted_runs().len(), 3);
        levels.check_invariants().unwrap();
    }
}
