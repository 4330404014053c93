//! Immutable on-disk segment files (SSTs) and their registry.
//!
//! A segment is a sorted run of records produced by flushing a frozen
//! MemStore or by compacting older segments. Once written it never changes;
//! space is reclaimed only by compaction writing a replacement and deleting
//! the sources.
//!
//! # File Layout
//!
//! A segment file is a plain sequence of records sorted by key:
//!
//! ```text
//! +----------------+---------------+------------+-----+--------------+-------+
//! | timestamp      | tombstone     | key_len    | key | value_len    | value |
//! | (i64 LE)       | (u8: 0/1)     | (u32 LE)   |     | (u32 LE)     |       |
//! +----------------+---------------+------------+-----+--------------+-------+
//! ```
//!
//! Each segment keeps in memory its id, file path, total size, min/max key
//! and a sparse index mapping every [`INDEX_STRIDE`]-th key to its byte
//! offset. Lookups seek to the greatest indexed key at or below the query
//! and scan forward from there.

pub mod index;
pub mod set;

pub use set::SegmentSet;

use crate::error::Result;
use crate::memstore::Record;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use index::SparseIndex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File extension for segment files.
pub const SEGMENT_EXT: &str = "sst";

/// Every k-th record lands in the sparse index.
pub const INDEX_STRIDE: usize = 10;

/// An immutable sorted segment file plus its in-memory metadata. Metadata is
/// fixed at construction, so readers share a segment without locking; the
/// file itself is opened per lookup.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    size: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    index: SparseIndex,
}

impl Segment {
    /// Writes a batch of records (already sorted by key, tombstones included)
    /// to a new segment file and returns its handle. The batch must not be
    /// empty.
    pub fn create(id: u64, path: PathBuf, records: &[Record]) -> Result<Self> {
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        let mut index = SparseIndex::new();
        let mut offset = 0u64;
        for (i, record) in records.iter().enumerate() {
            if i % INDEX_STRIDE == 0 {
                index.push(record.key.clone(), offset);
            }
            offset += write_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(Self {
            id,
            path,
            size: offset,
            min_key: records[0].key.clone(),
            max_key: records[records.len() - 1].key.clone(),
            index,
        })
    }

    /// Opens an existing segment file, rebuilding the sparse index and
    /// min/max keys by streaming through every record. The numeric file stem
    /// is the segment id.
    pub fn open(path: PathBuf) -> Result<Self> {
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
            .ok_or_else(|| {
                crate::Error::InvalidData(format!("invalid segment file name: {:?}", path))
            })?;

        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);

        let mut index = SparseIndex::new();
        let mut min_key = Vec::new();
        let mut max_key = Vec::new();
        let mut offset = 0u64;
        let mut count = 0usize;

        while let Some(record) = read_record(&mut reader)? {
            if count % INDEX_STRIDE == 0 {
                index.push(record.key.clone(), offset);
            }
            if count == 0 {
                min_key = record.key.clone();
            }
            max_key = record.key;
            offset += record_len(record.value.len() as u64, max_key.len() as u64);
            count += 1;
        }

        Ok(Self {
            id,
            path,
            size: offset,
            min_key,
            max_key,
            index,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Whether the key falls within this segment's [min, max] range. Lookups
    /// skip segments whose range excludes the query.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= &self.min_key[..] && key <= &self.max_key[..]
    }

    /// Searches this segment for a key. Seeks to the sparse-index window and
    /// scans forward; because records are sorted, the scan stops as soon as a
    /// key greater than the query appears. Returns the record as stored, so
    /// callers observe tombstones.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        let start = self.index.seek(key).unwrap_or(0);

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut reader = BufReader::new(file);

        while let Some(record) = read_record(&mut reader)? {
            if record.key[..] == *key {
                return Ok(Some(record));
            }
            if record.key[..] > *key {
                break;
            }
        }
        Ok(None)
    }

    /// Reads every record in the segment, in key order. Used by compaction.
    pub fn read_all(&self) -> Result<Vec<Record>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        while let Some(record) = read_record(&mut reader)? {
            records.push(record);
        }
        Ok(records)
    }
}

fn record_len(value_len: u64, key_len: u64) -> u64 {
    8 + 1 + 4 + key_len + 4 + value_len
}

fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<u64> {
    writer.write_i64::<LittleEndian>(record.timestamp)?;
    writer.write_u8(record.tombstone as u8)?;
    writer.write_u32::<LittleEndian>(record.key.len() as u32)?;
    writer.write_all(&record.key)?;
    writer.write_u32::<LittleEndian>(record.value.len() as u32)?;
    writer.write_all(&record.value)?;
    Ok(record_len(
        record.value.len() as u64,
        record.key.len() as u64,
    ))
}

fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let timestamp = match reader.read_i64::<LittleEndian>() {
        Ok(ts) => ts,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let tombstone = reader.read_u8()? != 0;

    let key_len = reader.read_u32::<LittleEndian>()? as usize;
    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;

    let value_len = reader.read_u32::<LittleEndian>()? as usize;
    let mut value = vec![0u8; value_len];
    reader.read_exact(&mut value)?;

    Ok(Some(Record {
        key,
        value,
        timestamp,
        tombstone,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::next_timestamp;
    use tempfile::TempDir;

    fn sorted_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Record::put(
                    format!("key_{:03}", i).into_bytes(),
                    format!("value_{:03}", i).into_bytes(),
                    next_timestamp(),
                )
            })
            .collect()
    }

    #[test]
    fn test_create_and_get() {
        let dir = TempDir::new().unwrap();
        let records = sorted_records(100);
        let segment = Segment::create(1, dir.path().join("000001.sst"), &records).unwrap();

        assert_eq!(segment.id(), 1);
        assert_eq!(segment.min_key(), b"key_000");
        assert_eq!(segment.max_key(), b"key_099");
        assert_eq!(segment.index.len(), 10);

        for record in &records {
            let found = segment.get(&record.key).unwrap().expect("key not found");
            assert_eq!(found, *record);
        }
    }

    #[test]
    fn test_get_misses() {
        let dir = TempDir::new().unwrap();
        let records = sorted_records(30);
        let segment = Segment::create(1, dir.path().join("000001.sst"), &records).unwrap();

        // Between entries, and past the last indexed window.
        assert!(segment.get(b"key_0005").unwrap().is_none());
        assert!(segment.get(b"key_0995").unwrap().is_none());
    }

    #[test]
    fn test_tombstones_are_returned() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            Record::put(b"alive".to_vec(), b"v".to_vec(), next_timestamp()),
            Record::tombstone(b"dead".to_vec(), next_timestamp()),
        ];
        let segment = Segment::create(1, dir.path().join("000001.sst"), &records).unwrap();

        let record = segment.get(b"dead").unwrap().unwrap();
        assert!(record.tombstone);
        assert!(!segment.get(b"alive").unwrap().unwrap().tombstone);
    }

    #[test]
    fn test_open_rebuilds_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("000042.sst");
        let records = sorted_records(25);
        let written = Segment::create(42, path.clone(), &records).unwrap();

        let opened = Segment::open(path).unwrap();
        assert_eq!(opened.id(), 42);
        assert_eq!(opened.size(), written.size());
        assert_eq!(opened.min_key(), written.min_key());
        assert_eq!(opened.max_key(), written.max_key());
        assert_eq!(opened.index.len(), written.index.len());

        for record in &records {
            assert_eq!(opened.get(&record.key).unwrap().unwrap(), *record);
        }
    }

    #[test]
    fn test_open_rejects_bad_file_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notanumber.sst");
        std::fs::write(&path, b"").unwrap();
        assert!(Segment::open(path).is_err());
    }

    #[test]
    fn test_read_all() {
        let dir = TempDir::new().unwrap();
        let records = sorted_records(15);
        let segment = Segment::create(1, dir.path().join("000001.sst"), &records).unwrap();
        assert_eq!(segment.read_all().unwrap(), records);
    }

    #[test]
    fn test_contains() {
        let dir = TempDir::new().unwrap();
        let records = sorted_records(10);
        let segment = Segment::create(1, dir.path().join("000001.sst"), &records).unwrap();

        assert!(segment.contains(b"key_000"));
        assert!(segment.contains(b"key_005"));
        assert!(segment.contains(b"key_009"));
        assert!(!segment.contains(b"key_0095"));
        assert!(!segment.contains(b"a"));
        assert!(!segment.contains(b"z"));
    }
}
