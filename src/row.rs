//! Record shape and key comparator.
//!
//! The distilled spec leaves the key/value row types abstract. This
//! expansion encodes them as a generic `Row: Ord + Clone + Send + Sync` /
//! `V: Clone + Send + Sync` pair rather than the teacher's fixed `u64` key,
//! with a `Bytes`-backed row (lexicographic `Ord`) as the default concrete
//! type used by the reference codec and tests — mirroring how the teacher's
//! SSTable layer serializes keys as order-preserving byte arrays.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A lexicographically ordered byte-string row. The default key/value type
/// used by the reference codec, bloom filter, and integration tests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BytesRow(pub Vec<u8>);

impl BytesRow {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for BytesRow {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for BytesRow {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for BytesRow {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Sequence numbers are assigned by a writer in strictly increasing order;
/// they break ties between equal keys (higher sequence wins).
pub type SequenceNumber = u64;

/// A KeyValue's kind: either a live value or a tombstone marking the key
/// removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Add,
    Delete,
}

/// Tuple of (key, sequence number, value kind, value). The unit record the
/// write path moves around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue<K, V> {
    pub key: K,
    pub sequence: SequenceNumber,
    pub kind: ValueKind,
    pub value: V,
}

impl<K, V> KeyValue<K, V> {
    pub fn add(key: K, sequence: SequenceNumber, value: V) -> Self {
        Self { key, sequence, kind: ValueKind::Add, value }
    }

    pub fn delete(key: K, sequence: SequenceNumber, value: V) -> Self {
        Self { key, sequence, kind: ValueKind::Delete, value }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, ValueKind::Delete)
    }
}

/// Orders by key ascending, then by sequence number descending — the same
/// tie-break the merge-tree reader's min-heap relies on.
pub fn key_seq_order<K: Ord, V>(a: &KeyValue<K, V>, b: &KeyValue<K, V>) -> Ordering {
    a.key.cmp(&b.key).then(b.sequence.cmp(&a.sequence))
}

/// Reduces an ascending-sequence group of KeyValues sharing one key to zero
/// or one output KeyValue. Must be cheap to clone: concurrent readers each
/// hold their own instance so no mutable reducer state is shared.
pub trait MergeFunction<K, V>: Send + Sync {
    fn merge(&self, group: &[KeyValue<K, V>]) -> Option<KeyValue<K, V>>;

    fn clone_box(&self) -> Box<dyn MergeFunction<K, V>>;
}

impl<K, V> Clone for Box<dyn MergeFunction<K, V>> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The simplest merge policy: the KeyValue with the highest sequence number
/// wins outright, regardless of kind.
#[derive(Debug, Clone, Default)]
pub struct LastValueWins;

impl<K, V> MergeFunction<K, V> for LastValueWins
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn merge(&self, group: &[KeyValue<K, V>]) -> Option<KeyValue<K, V>> {
        group.iter().max_by_key(|kv| kv.sequence).cloned()
    }

    fn clone_box(&self) -> Box<dyn MergeFunction<K, V>> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_value_wins_picks_highest_sequence() {
        let group = vec![
            KeyValue::add(BytesRow::from("k"), 1, BytesRow::from("a")),
            KeyValue::add(BytesRow::from("k"), 3, BytesRow::from("c")),
            KeyValue::add(BytesRow::from("k"), 2, BytesRow::from("b")),
        ];
        let merged = LastValueWins.merge(&group).unwrap();
        assert_eq!(merged.sequence, 3);
        assert_eq!(merged.value.as_slice(), b"c");
    }

    #[test]
    fn key_seq_order_breaks_ties_by_descending_sequence() {
        let a = KeyValue::add(BytesRow::from("k"), 5, BytesRow::from("x"));
        let b = KeyValue::add(BytesRow::from("k"), 9, BytesRow::from("y"));
        assert_eq!(key_seq_order(&a, &b), Ordering::Greater);
    }
}
