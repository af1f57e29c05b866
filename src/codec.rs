//! File-format codec and rolling writer: out-of-scope external collaborator
//! per the data model, given a concrete reference implementation here.
//!
//! Grounded on `motedb::storage::lsm::sstable`'s block layout (length-
//! prefixed, Snappy-compressed blocks, a bloom filter and a trailing footer
//! with a magic number and version) reduced to what a generic
//! `KeyValue<K, V>` codec needs: no separate block index, since the
//! merge-tree reader only ever consumes a file by scanning it start to end.
//! The bloom filter sits between the data blocks and the footer, same as
//! `bloom_offset` in the teacher's SSTable footer.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bloom::BloomFilter;
use crate::error::{Result, StorageError};
use crate::file_meta::DataFileMeta;
use crate::path::PathFactory;
use crate::row::{KeyValue, SequenceNumber};

const MAGIC: u64 = 0x4255_434B_4C53_4D00; // "BUCKLSM\0"
const VERSION: u32 = 1;
const FOOTER_LEN: u64 = 8 + 4 + 8 + 8; // magic + version + block_count + bloom_len

/// Writes `KeyValue<K, V>` records into blocks of up to `block_records`
/// entries, each Snappy-compressed and CRC32-checksummed.
pub struct BincodeRecordWriter<K, V> {
    writer: BufWriter<File>,
    block_buf: Vec<KeyValue<K, V>>,
    block_records: usize,
    block_count: u64,
    bytes_written: u64,
}

impl<K, V> BincodeRecordWriter<K, V>
where
    K: Serialize,
    V: Serialize,
{
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            block_buf: Vec::new(),
            block_records: 4096,
            block_count: 0,
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn push(&mut self, kv: KeyValue<K, V>) -> Result<()> {
        self.block_buf.push(kv);
        if self.block_buf.len() >= self.block_records {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let raw = bincode::serialize(&self.block_buf)?;
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| StorageError::CorruptFile { path: PathBuf::new(), reason: e.to_string() })?;
        let checksum = crc32fast::hash(&compressed);

        self.writer.write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.writer.write_all(&checksum.to_le_bytes())?;
        self.writer.write_all(&compressed)?;

        self.bytes_written += 8 + compressed.len() as u64;
        self.block_count += 1;
        self.block_buf.clear();
        Ok(())
    }

    /// Flushes any remaining records, writes `bloom` (the file's serialized
    /// bloom filter, or an empty slice if none) followed by the footer, and
    /// fsyncs.
    pub fn finish(mut self, bloom: &[u8]) -> Result<u64> {
        self.flush_block()?;
        self.writer.write_all(bloom)?;
        self.writer.write_all(&MAGIC.to_le_bytes())?;
        self.writer.write_all(&VERSION.to_le_bytes())?;
        self.writer.write_all(&self.block_count.to_le_bytes())?;
        self.writer.write_all(&(bloom.len() as u64).to_le_bytes())?;
        self.bytes_written += bloom.len() as u64 + FOOTER_LEN;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.bytes_written)
    }
}

/// Reads back the blocks written by `BincodeRecordWriter`, yielding records
/// in the order they were written (ascending key order, since the merge-tree
/// writer only ever drains its buffer in key order before handing records to
/// the rolling writer).
pub struct BincodeRecordReader<K, V> {
    reader: BufReader<File>,
    remaining_blocks: u64,
    pending: std::vec::IntoIter<KeyValue<K, V>>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> BincodeRecordReader<K, V>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN {
            return Err(StorageError::CorruptFile {
                path: path.to_path_buf(),
                reason: "file shorter than footer".into(),
            });
        }
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.read_exact(&mut footer)?;
        let magic = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let version = u32::from_le_bytes(footer[8..12].try_into().unwrap());
        let block_count = u64::from_le_bytes(footer[12..20].try_into().unwrap());
        // footer[20..28] is bloom_len; data blocks run from offset 0 up to
        // where the bloom bytes start, and the block-count-driven read loop
        // below stops there on its own, so it's only needed by
        // `read_bloom_bytes`.
        if magic != MAGIC {
            return Err(StorageError::CorruptFile {
                path: path.to_path_buf(),
                reason: "bad magic number".into(),
            });
        }
        if version != VERSION {
            return Err(StorageError::CorruptFile {
                path: path.to_path_buf(),
                reason: format!("unsupported version {version}"),
            });
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            reader: BufReader::new(file),
            remaining_blocks: block_count,
            pending: Vec::new().into_iter(),
            _marker: PhantomData,
        })
    }

    fn next_block(&mut self) -> Result<Option<Vec<KeyValue<K, V>>>> {
        if self.remaining_blocks == 0 {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        let mut crc_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf)?;
        self.reader.read_exact(&mut crc_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let expected_crc = u32::from_le_bytes(crc_buf);

        let mut compressed = vec![0u8; len];
        self.reader.read_exact(&mut compressed)?;
        let actual_crc = crc32fast::hash(&compressed);
        if actual_crc != expected_crc {
            return Err(StorageError::CorruptFile {
                path: PathBuf::new(),
                reason: "block checksum mismatch".into(),
            });
        }

        let raw = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .map_err(|e| StorageError::CorruptFile { path: PathBuf::new(), reason: e.to_string() })?;
        let records: Vec<KeyValue<K, V>> = bincode::deserialize(&raw)?;
        self.remaining_blocks -= 1;
        Ok(Some(records))
    }
}

impl<K, V> Iterator for BincodeRecordReader<K, V>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    type Item = Result<KeyValue<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(kv) = self.pending.next() {
                return Some(Ok(kv));
            }
            match self.next_block() {
                Ok(Some(records)) => self.pending = records.into_iter(),
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Reads back the bloom filter bytes a `RollingWriter` embedded in a data
/// file's footer, without scanning the file's data blocks. Mirrors the
/// teacher's SSTable reading `bloom_offset` back out on open.
pub fn read_bloom_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len < FOOTER_LEN {
        return Err(StorageError::CorruptFile {
            path: path.to_path_buf(),
            reason: "file shorter than footer".into(),
        });
    }
    file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let mut footer = [0u8; FOOTER_LEN as usize];
    file.read_exact(&mut footer)?;
    let bloom_len = u64::from_le_bytes(footer[20..28].try_into().unwrap());
    if bloom_len == 0 {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::End(-(FOOTER_LEN as i64) - (bloom_len as i64)))?;
    let mut bloom = vec![0u8; bloom_len as usize];
    file.read_exact(&mut bloom)?;
    Ok(bloom)
}

/// A rolling writer that feeds a sorted stream of records into the codec
/// above, closing and rotating the current output file whenever
/// `target_file_size` is reached. Produces one `DataFileMeta` per file,
/// with that file's bloom filter embedded in its footer and its serialized
/// bytes carried on the meta.
pub struct RollingWriter<'a, K, V> {
    path_factory: &'a dyn PathFactory,
    partition: String,
    bucket: u32,
    level: usize,
    target_file_size: u64,
    bits_per_key: usize,
    current: Option<CurrentFile<K, V>>,
    finished: Vec<DataFileMeta<K>>,
}

struct CurrentFile<K, V> {
    path: PathBuf,
    writer: BincodeRecordWriter<K, V>,
    bloom: BloomFilter,
    min_key: Option<K>,
    max_key: Option<K>,
    min_sequence: SequenceNumber,
    max_sequence: SequenceNumber,
    row_count: u64,
}

impl<'a, K, V> RollingWriter<'a, K, V>
where
    K: Ord + Clone + Serialize + AsRef<[u8]>,
    V: Serialize,
{
    pub fn new(
        path_factory: &'a dyn PathFactory,
        partition: impl Into<String>,
        bucket: u32,
        level: usize,
        target_file_size: u64,
        bits_per_key: usize,
    ) -> Self {
        Self {
            path_factory,
            partition: partition.into(),
            bucket,
            level,
            target_file_size,
            bits_per_key,
            current: None,
            finished: Vec::new(),
        }
    }

    pub fn write(&mut self, kv: KeyValue<K, V>) -> Result<()> {
        if self.current.is_none() {
            self.open_new_file()?;
        }
        let current = self.current.as_mut().unwrap();
        current.bloom.insert(kv.key.as_ref());
        current.min_key.get_or_insert_with(|| kv.key.clone());
        current.max_key = Some(kv.key.clone());
        current.min_sequence = current.min_sequence.min(kv.sequence);
        current.max_sequence = current.max_sequence.max(kv.sequence);
        current.row_count += 1;
        current.writer.push(kv)?;

        if self.current.as_ref().unwrap().writer.bytes_written() >= self.target_file_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn open_new_file(&mut self) -> Result<()> {
        let path = self.path_factory.new_path(&self.partition, self.bucket, self.level);
        let writer = BincodeRecordWriter::create(&path)?;
        self.current = Some(CurrentFile {
            path,
            writer,
            bloom: BloomFilter::new(4096, self.bits_per_key),
            min_key: None,
            max_key: None,
            min_sequence: SequenceNumber::MAX,
            max_sequence: 0,
            row_count: 0,
        });
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(current) = self.current.take() {
            let bloom_bytes = current.bloom.to_bytes();
            let file_size = current.writer.finish(&bloom_bytes)?;
            if current.row_count > 0 {
                self.finished.push(DataFileMeta {
                    file_name: current.path.to_string_lossy().into_owned(),
                    min_key: current.min_key.unwrap(),
                    max_key: current.max_key.unwrap(),
                    min_sequence: current.min_sequence,
                    max_sequence: current.max_sequence,
                    row_count: current.row_count,
                    file_size,
                    level: self.level,
                    bloom_filter: bloom_bytes,
                });
            } else {
                let _ = std::fs::remove_file(&current.path);
            }
        }
        Ok(())
    }

    /// Finalizes any open file and returns the produced file metas. An
    /// empty rolling writer (no records ever written) produces zero files.
    pub fn finish(mut self) -> Result<Vec<DataFileMeta<K>>> {
        self.rotate()?;
        Ok(self.finished)
    }

    /// Deletes every file this writer has produced so far, including the
    /// one currently open. Used when a flush or compaction aborts partway
    /// through so no partial output is left behind.
    pub fn abort(self) {
        if let Some(current) = self.current {
            drop(current.writer);
            let _ = std::fs::remove_file(&current.path);
        }
        for meta in self.finished {
            let _ = std::fs::remove_file(&meta.file_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::DefaultPathFactory;
    use crate::row::BytesRow;

    #[test]
    fn writer_then_reader_round_trips_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DefaultPathFactory::new(dir.path());
        let mut rolling: RollingWriter<BytesRow, BytesRow> =
            RollingWriter::new(&factory, "p0", 0, 0, u64::MAX, 10);

        for i in 0..50u32 {
            let key = BytesRow::from(format!("k{i:04}").into_bytes());
            let val = BytesRow::from(format!("v{i:04}").into_bytes());
            rolling.write(KeyValue::add(key, i as u64, val)).unwrap();
        }
        let metas = rolling.finish().unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].row_count, 50);

        let reader: BincodeRecordReader<BytesRow, BytesRow> =
            BincodeRecordReader::open(Path::new(&metas[0].file_name)).unwrap();
        let records: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 50);
        assert_eq!(records[0].key.as_slice(), b"k0000");
        assert_eq!(records[49].key.as_slice(), b"k0049");
    }

    #[test]
    fn bloom_filter_is_embedded_in_the_footer_and_carried_on_the_meta() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DefaultPathFactory::new(dir.path());
        let mut rolling: RollingWriter<BytesRow, BytesRow> =
            RollingWriter::new(&factory, "p0", 0, 0, u64::MAX, 10);

        for i in 0..20u32 {
            let key = BytesRow::from(format!("k{i:04}").into_bytes());
            rolling.write(KeyValue::add(key, i as u64, BytesRow::from("v"))).unwrap();
        }
        let metas = rolling.finish().unwrap();
        assert_eq!(metas.len(), 1);
        assert!(!metas[0].bloom_filter.is_empty());

        let bloom = metas[0].bloom_filter().unwrap();
        assert_eq!(bloom.byte_size(), metas[0].bloom_filter.len());
        assert!(bloom.may_contain(b"k0000"));
        assert!(!bloom.may_contain(b"not-a-real-key"));

        let from_disk = read_bloom_bytes(Path::new(&metas[0].file_name)).unwrap();
        assert_eq!(from_disk, metas[0].bloom_filter);
    }

    #[test]
    fn empty_buffer_flush_produces_zero_files() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DefaultPathFactory::new(dir.path());
        let rolling: RollingWriter<BytesRow, BytesRow> =
            RollingWriter::new(&factory, "p0", 0, 0, u64::MAX, 10);
        assert!(rolling.finish().unwrap().is_empty());
    }

    #[test]
    fn target_file_size_rotates_into_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DefaultPathFactory::new(dir.path());
        let mut rolling: RollingWriter<BytesRow, BytesRow> =
            RollingWriter::new(&factory, "p0", 0, 0, 64, 10);

        for i in 0..200u32 {
            let key = BytesRow::from(format!("k{i:05}").into_bytes());
            let val = BytesRow::from(vec![0u8; 32]);
            rolling.write(KeyValue::add(key, i as u64, val)).unwrap();
        }
        let metas = rolling.finish().unwrap();
        assert!(metas.len() > 1);
        let total_rows: u64 = metas.iter().map(|m| m.row_count).sum();
        assert_eq!(total_rows, 200);
    }
}
