//! K-way merge over sections of overlapping runs, applying the merge
//! function and optional delete-drop. Grounded on
//! `motedb::storage::lsm::merging_iterator::MergingIterator`'s min-heap
//! design, generalized from MVCC timestamp dedup to the spec's
//! seq-ordered-group-reduced-by-merge-function model.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::row::{KeyValue, MergeFunction};

/// One already-open, already-sorted source of records: either an L0 run's
/// single file or the chain of files making up a higher-level sorted run.
pub type RunIterator<K, V> = Box<dyn Iterator<Item = Result<KeyValue<K, V>>> + Send>;

struct HeapEntry<K, V> {
    kv: KeyValue<K, V>,
    source_id: usize,
}

impl<K: PartialEq, V> PartialEq for HeapEntry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.kv.key == other.kv.key && self.kv.sequence == other.kv.sequence
    }
}
impl<K: Eq, V> Eq for HeapEntry<K, V> {}

impl<K: Ord, V> PartialOrd for HeapEntry<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, V> Ord for HeapEntry<K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Key ascending first, then sequence descending, then source id for
        // a stable tie-break — the same ordering `key_seq_order` expresses.
        self.kv
            .key
            .cmp(&other.kv.key)
            .then(other.kv.sequence.cmp(&self.kv.sequence))
            .then(self.source_id.cmp(&other.source_id))
    }
}

/// Merges one section (a list of overlapping runs whose combined key range
/// is disjoint from every other section) into an ordered stream of grouped,
/// merge-function-reduced KeyValues.
struct SectionMerger<K, V> {
    heap: BinaryHeap<Reverse<HeapEntry<K, V>>>,
    sources: Vec<RunIterator<K, V>>,
    lookahead: Option<HeapEntry<K, V>>,
}

impl<K: Ord + Clone, V> SectionMerger<K, V> {
    fn new(mut sources: Vec<RunIterator<K, V>>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source_id, source) in sources.iter_mut().enumerate() {
            if let Some(item) = source.next() {
                heap.push(Reverse(HeapEntry { kv: item?, source_id }));
            }
        }
        Ok(Self { heap, sources, lookahead: None })
    }

    fn pop(&mut self) -> Result<Option<HeapEntry<K, V>>> {
        if let Some(entry) = self.lookahead.take() {
            return Ok(Some(entry));
        }
        let Reverse(entry) = match self.heap.pop() {
            Some(e) => e,
            None => return Ok(None),
        };
        if let Some(next) = self.sources[entry.source_id].next() {
            self.heap.push(Reverse(HeapEntry { kv: next?, source_id: entry.source_id }));
        }
        Ok(Some(entry))
    }

    /// Pulls every entry sharing the next distinct key, in ascending
    /// sequence order, for the merge function to reduce. The merge
    /// function is called at most once per distinct key per section.
    fn next_group(&mut self) -> Result<Option<Vec<KeyValue<K, V>>>> {
        let first = match self.pop()? {
            Some(e) => e,
            None => return Ok(None),
        };
        let key = first.kv.key.clone();
        let mut group = vec![first.kv];
        loop {
            match self.pop()? {
                None => break,
                Some(entry) => {
                    if entry.kv.key == key {
                        group.push(entry.kv);
                    } else {
                        self.lookahead = Some(entry);
                        break;
                    }
                }
            }
        }
        group.sort_by_key(|kv| kv.sequence);
        Ok(Some(group))
    }
}

/// Lazy, ordered sequence of merged KeyValues. Sections are consumed in
/// order; the reader is finite, forward-only, and non-restartable.
pub struct MergeTreeReader<K, V> {
    sections: std::vec::IntoIter<Vec<RunIterator<K, V>>>,
    current: Option<SectionMerger<K, V>>,
    merge_fn: Box<dyn MergeFunction<K, V>>,
    drop_delete: bool,
}

impl<K, V> MergeTreeReader<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    pub fn new(
        sections: Vec<Vec<RunIterator<K, V>>>,
        merge_fn: Box<dyn MergeFunction<K, V>>,
        drop_delete: bool,
    ) -> Self {
        Self { sections: sections.into_iter(), current: None, merge_fn, drop_delete }
    }

    fn advance_section(&mut self) -> Result<bool> {
        match self.sections.next() {
            None => Ok(false),
            Some(sources) => {
                self.current = Some(SectionMerger::new(sources)?);
                Ok(true)
            }
        }
    }
}

impl<K, V> Iterator for MergeTreeReader<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    type Item = Result<KeyValue<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.advance_section() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            let merger = self.current.as_mut().unwrap();
            match merger.next_group() {
                Ok(Some(group)) => {
                    let merged = self.merge_fn.merge(&group);
                    match merged {
                        Some(kv) if self.drop_delete && kv.is_delete() => continue,
                        Some(kv) => return Some(Ok(kv)),
                        None => continue,
                    }
                }
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{BytesRow, LastValueWins, ValueKind};

    fn src(items: Vec<KeyValue<BytesRow, BytesRow>>) -> RunIterator<BytesRow, BytesRow> {
        Box::new(items.into_iter().map(Ok))
    }

    #[test]
    fn merges_disjoint_runs_in_key_order() {
        let s1 = src(vec![
            KeyValue::add(BytesRow::from("a"), 1, BytesRow::from("1")),
            KeyValue::add(BytesRow::from("c"), 1, BytesRow::from("3")),
        ]);
        let s2 = src(vec![KeyValue::add(BytesRow::from("b"), 1, BytesRow::from("2"))]);

        let reader = MergeTreeReader::new(vec![vec![s1, s2]], Box::new(LastValueWins), false);
        let keys: Vec<String> = reader
            .map(|r| String::from_utf8(r.unwrap().key.0).unwrap())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn last_value_wins_collapses_duplicate_keys() {
        let s1 = src(vec![KeyValue::add(BytesRow::from("k"), 1, BytesRow::from("old"))]);
        let s2 = src(vec![KeyValue::add(BytesRow::from("k"), 2, BytesRow::from("new"))]);

        let reader = MergeTreeReader::new(vec![vec![s1, s2]], Box::new(LastValueWins), false);
        let results: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value.0, b"new");
    }

    #[test]
    fn drop_delete_discards_tombstones() {
        let s1 = src(vec![KeyValue::delete(BytesRow::from("k"), 2, BytesRow::from(""))]);
        let reader = MergeTreeReader::new(vec![vec![s1]], Box::new(LastValueWins), true);
        let results: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert!(results.is_empty());
    }

    #[test]
    fn retains_delete_when_not_dropping() {
        let s1 = src(vec![KeyValue::delete(BytesRow::from("k"), 2, BytesRow::from(""))]);
        let reader = MergeTreeReader::new(vec![vec![s1]], Box::new(LastValueWins), false);
        let results: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind, ValueKind::Delete);
    }

    #[test]
    fn sections_are_consumed_in_order() {
        let s1 = src(vec![KeyValue::add(BytesRow::from("z"), 1, BytesRow::from("last"))]);
        let s2 = src(vec![KeyValue::add(BytesRow::from("a"), 1, BytesRow::from("first"))]);
        // Two sections, consumed in the order given even though the second
        // section's keys would sort before the first's.
        let reader = MergeTreeReader::new(vec![vec![s1], vec![s2]], Box::new(LastValueWins), false);
        let keys: Vec<String> = reader
            .map(|r| String::from_utf8(r.unwrap().key.0).unwrap())
            .collect();
        assert_eq!(keys, vec!["z", "a"]);
    }
}
