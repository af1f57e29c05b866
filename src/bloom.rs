//! Per-file bloom filter for a fast negative existence check, ported from
//! `motedb::storage::lsm::bloom::BloomFilter`. The rolling writer inserts
//! every key as it streams a file, then serializes the filter into the
//! file's footer (`codec::BincodeRecordWriter::finish`) and carries the
//! same bytes on the file's `DataFileMeta`, mirroring how the teacher's
//! SSTable persists `bloom_offset` and reads it back on open.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
    num_bits: usize,
}

impl BloomFilter {
    /// `num_keys`: expected number of keys. `bits_per_key`: bits allocated
    /// per key (10 gives roughly a 1% false-positive rate).
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_keys = num_keys.max(1);
        let num_bits = num_keys * bits_per_key;
        let num_bytes = (num_bits + 7) / 8;

        let num_hashes = ((bits_per_key as f64) * 0.693).ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        Self { bits: vec![0u8; num_bytes], num_hashes, num_bits }
    }

    pub fn from_bytes(bits: Vec<u8>, num_hashes: u32) -> Self {
        let num_bits = bits.len() * 8;
        Self { bits, num_hashes, num_bits }
    }

    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.num_hashes {
            let bit_pos = (self.hash(key, i) as usize) % self.num_bits;
            self.set_bit(bit_pos);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.num_hashes {
            let bit_pos = (self.hash(key, i) as usize) % self.num_bits;
            if !self.get_bit(bit_pos) {
                return false;
            }
        }
        true
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&(self.num_bits as u64).to_le_bytes());
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn from_bytes_full(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let num_hashes = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let num_bits = u64::from_le_bytes(data[4..12].try_into().ok()?) as usize;
        let bits = data[12..].to_vec();
        Some(Self { bits, num_hashes, num_bits })
    }

    pub fn byte_size(&self) -> usize {
        12 + self.bits.len()
    }

    fn hash(&self, key: &[u8], seed: u32) -> u64 {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn set_bit(&mut self, pos: usize) {
        self.bits[pos / 8] |= 1 << (pos % 8);
    }

    fn get_bit(&self, pos: usize) -> bool {
        (self.bits[pos / 8] & (1 << (pos % 8))) != 0
    }
}
