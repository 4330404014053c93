//! In-memory write buffer layer.
//!
//! A `MemStore` holds the most recent mutations in a concurrent skip list
//! keyed by record key. Deletes are recorded as tombstones rather than
//! removals so they survive flushing to a segment and shadow older versions
//! of the key during lookups. Every record carries a process-local,
//! strictly monotonic nanosecond timestamp; within the store the record with
//! the highest timestamp for a key is the only one kept.

use crate::errinput;
use crate::error::Result;
use crate::Error;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum allowed key length in bytes (100KB).
pub const MAX_KEY_SIZE: usize = 100 * 1024;

/// A single versioned entry: key, value, timestamp and tombstone marker.
/// Tombstones carry an empty value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: i64,
    pub tombstone: bool,
}

impl Record {
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: i64) -> Self {
        Self {
            key,
            value,
            timestamp,
            tombstone: false,
        }
    }

    pub fn tombstone(key: Vec<u8>, timestamp: i64) -> Self {
        Self {
            key,
            value: Vec::new(),
            timestamp,
            tombstone: true,
        }
    }
}

/// Validates a key against the allowed character class and size bound.
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return errinput!("empty key");
    }
    if key.len() > MAX_KEY_SIZE {
        return errinput!("key too large: {} bytes (max {})", key.len(), MAX_KEY_SIZE);
    }
    let valid = key
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'_'));
    if !valid {
        return errinput!("invalid key format");
    }
    Ok(())
}

/// Returns the next record timestamp in nanoseconds. Strictly increasing
/// across the process even if the wall clock stalls or steps backwards.
pub fn next_timestamp() -> i64 {
    static CLOCK: AtomicI64 = AtomicI64::new(0);

    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);

    let mut last = CLOCK.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match CLOCK.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

#[derive(Debug)]
pub struct MemStore {
    entries: SkipMap<Vec<u8>, Record>,
    size: AtomicUsize, // approximate: sum(|key| + |value|) over entries
    max_size: usize,
    frozen: AtomicBool,
}

impl MemStore {
    /// Creates an empty MemStore with the given size limit.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: SkipMap::new(),
            size: AtomicUsize::new(0),
            max_size,
            frozen: AtomicBool::new(false),
        }
    }

    /// Inserts a record, replacing any prior record for the key and
    /// adjusting the size counter by the difference. Last-writer-wins by
    /// timestamp: a record older than the one already present is dropped,
    /// which makes WAL replay order-independent and idempotent. This is the
    /// single mutation path: `put` and `delete` build the record, replay
    /// feeds recovered records straight through (including tombstones for
    /// keys this store has never seen).
    pub fn apply(&self, record: Record) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        if let Some(old) = self.entries.get(&record.key) {
            let old = old.value();
            if old.timestamp > record.timestamp {
                return Ok(());
            }
            self.size
                .fetch_sub(old.key.len() + old.value.len(), Ordering::SeqCst);
        }
        self.size
            .fetch_add(record.key.len() + record.value.len(), Ordering::SeqCst);
        self.entries.insert(record.key.clone(), record);
        Ok(())
    }

    /// Inserts or overwrites a key with the given value and timestamp.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, timestamp: i64) -> Result<()> {
        self.apply(Record::put(key, value, timestamp))
    }

    /// Marks a key as deleted. Returns false when the key is absent from this
    /// store or already tombstoned; otherwise replaces the record with a
    /// tombstone at the given timestamp.
    pub fn delete(&self, key: &[u8], timestamp: i64) -> Result<bool> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        match self.entries.get(key) {
            None => Ok(false),
            Some(entry) if entry.value().tombstone => Ok(false),
            Some(_) => {
                self.apply(Record::tombstone(key.to_vec(), timestamp))?;
                Ok(true)
            }
        }
    }

    /// Returns the record for a key, tombstones included. Callers walking the
    /// layered stores must treat a tombstone as authoritative absence.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// All non-tombstoned keys, in sorted order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|entry| !entry.value().tombstone)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Values of all non-tombstoned keys starting with the prefix.
    pub fn prefix_scan(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(|entry| entry.key().starts_with(prefix))
            .filter(|entry| !entry.value().tombstone)
            .map(|entry| entry.value().value.clone())
            .collect()
    }

    /// Approximate size in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All records in key order, tombstones included. Used to build a segment.
    pub fn drain(&self) -> Vec<Record> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Removes every entry and resets the size counter.
    pub fn clear(&self) {
        while self.entries.pop_front().is_some() {}
        self.size.store(0, Ordering::SeqCst);
    }

    /// Marks the store read-only. Fails if it is already frozen.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemStore {
        MemStore::new(1024)
    }

    #[test]
    fn test_put_and_get() {
        let store = store();
        store
            .put(b"key1".to_vec(), b"value1".to_vec(), next_timestamp())
            .unwrap();
        store
            .put(b"key2".to_vec(), b"value2".to_vec(), next_timestamp())
            .unwrap();

        assert_eq!(store.get(b"key1").unwrap().value, b"value1");
        assert_eq!(store.get(b"key2").unwrap().value, b"value2");
        assert!(store.get(b"key3").is_none());
    }

    #[test]
    fn test_overwrite_adjusts_size() {
        let store = store();
        store
            .put(b"key".to_vec(), b"aaaa".to_vec(), next_timestamp())
            .unwrap();
        assert_eq!(store.size(), 7);

        store
            .put(b"key".to_vec(), b"bb".to_vec(), next_timestamp())
            .unwrap();
        assert_eq!(store.size(), 5);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"key").unwrap().value, b"bb");
    }

    #[test]
    fn test_delete_marks_tombstone() {
        let store = store();
        store
            .put(b"key".to_vec(), b"value".to_vec(), next_timestamp())
            .unwrap();

        assert!(store.delete(b"key", next_timestamp()).unwrap());
        let record = store.get(b"key").unwrap();
        assert!(record.tombstone);
        assert!(record.value.is_empty());

        // Absent and already-tombstoned keys report false.
        assert!(!store.delete(b"key", next_timestamp()).unwrap());
        assert!(!store.delete(b"missing", next_timestamp()).unwrap());
    }

    #[test]
    fn test_tombstone_size_accounting() {
        let store = store();
        store
            .put(b"key".to_vec(), b"value".to_vec(), next_timestamp())
            .unwrap();
        assert_eq!(store.size(), 8);

        store.delete(b"key", next_timestamp()).unwrap();
        // The key remains counted, the value does not.
        assert_eq!(store.size(), 3);
    }

    #[test]
    fn test_keys_and_prefix_scan_skip_tombstones() {
        let store = store();
        store
            .put(b"user:a".to_vec(), b"A".to_vec(), next_timestamp())
            .unwrap();
        store
            .put(b"user:b".to_vec(), b"B".to_vec(), next_timestamp())
            .unwrap();
        store
            .put(b"other".to_vec(), b"X".to_vec(), next_timestamp())
            .unwrap();
        store.delete(b"user:b", next_timestamp()).unwrap();

        assert_eq!(store.keys(), vec![b"other".to_vec(), b"user:a".to_vec()]);
        assert_eq!(store.prefix_scan(b"user:"), vec![b"A".to_vec()]);
    }

    #[test]
    fn test_is_full() {
        let store = MemStore::new(10);
        assert!(!store.is_full());
        store
            .put(b"key".to_vec(), b"1234567".to_vec(), next_timestamp())
            .unwrap();
        assert!(store.is_full());
    }

    #[test]
    fn test_drain_sorted_with_tombstones() {
        let store = store();
        store
            .put(b"c".to_vec(), b"3".to_vec(), next_timestamp())
            .unwrap();
        store
            .put(b"a".to_vec(), b"1".to_vec(), next_timestamp())
            .unwrap();
        store
            .put(b"b".to_vec(), b"2".to_vec(), next_timestamp())
            .unwrap();
        store.delete(b"b", next_timestamp()).unwrap();

        let records = store.drain();
        let keys: Vec<_> = records.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(records[1].tombstone);
    }

    #[test]
    fn test_freeze_rejects_writes() {
        let store = store();
        store.freeze().unwrap();
        assert!(matches!(
            store.put(b"key".to_vec(), b"value".to_vec(), next_timestamp()),
            Err(Error::Frozen)
        ));
        assert!(matches!(store.freeze(), Err(Error::Frozen)));
    }

    #[test]
    fn test_apply_is_last_writer_wins_by_timestamp() {
        // Replay may present records out of order; the newer one must win
        // and re-applying the same log must be a no-op.
        let store = store();
        let newer = Record::put(b"k".to_vec(), b"new".to_vec(), 200);
        let older = Record::put(b"k".to_vec(), b"old".to_vec(), 100);

        store.apply(newer.clone()).unwrap();
        store.apply(older).unwrap();
        assert_eq!(store.get(b"k").unwrap().value, b"new");

        store.apply(newer).unwrap();
        assert_eq!(store.get(b"k").unwrap().value, b"new");
        assert_eq!(store.size(), 4);
    }

    #[test]
    fn test_apply_tombstone_for_unseen_key() {
        // Recovery replays delete records for keys that may only live in a
        // segment; the tombstone must still materialize.
        let store = store();
        store
            .apply(Record::tombstone(b"gone".to_vec(), next_timestamp()))
            .unwrap();
        assert!(store.get(b"gone").unwrap().tombstone);
    }

    #[test]
    fn test_clear() {
        let store = store();
        store
            .put(b"key".to_vec(), b"value".to_vec(), next_timestamp())
            .unwrap();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key(b"a-zA-Z0.9:_").is_ok());
        assert!(validate_key(&vec![b'k'; MAX_KEY_SIZE]).is_ok());
        assert!(validate_key(&vec![b'k'; MAX_KEY_SIZE + 1]).is_err());
        assert!(validate_key(b"").is_err());
        assert!(validate_key(b"has space").is_err());
        assert!(validate_key(b"pipe|char").is_err());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut last = next_timestamp();
        for _ in 0..1000 {
            let ts = next_timestamp();
            assert!(ts > last);
            last = ts;
        }
    }
}
