//! Registry of all live segments, ordered newest-first.

use super::{Segment, SEGMENT_EXT};
use crate::error::Result;
use crate::memstore::Record;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Thread-safe registry of segments. Only the flush and compaction workers
/// mutate the list; every lookup reads it. Lookups take the lock just long
/// enough to snapshot the list, then release it before touching any files,
/// so flush and compaction never block readers on I/O.
#[derive(Debug)]
pub struct SegmentSet {
    dir: PathBuf,
    segments: RwLock<Vec<Arc<Segment>>>, // newest first
    next_id: AtomicU64,
}

impl SegmentSet {
    /// Scans the data directory for segment files, rebuilds their in-memory
    /// metadata, and orders them newest-first. The next id continues after
    /// the highest one found.
    pub fn recover(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == SEGMENT_EXT) {
                match Segment::open(path.clone()) {
                    Ok(segment) => segments.push(Arc::new(segment)),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable segment file")
                    }
                }
            }
        }
        segments.sort_by(|a, b| b.id().cmp(&a.id()));

        let next_id = segments.first().map_or(1, |s| s.id() + 1);
        tracing::info!(
            segment_count = segments.len(),
            next_id,
            "recovered segment registry"
        );

        Ok(Self {
            dir,
            segments: RwLock::new(segments),
            next_id: AtomicU64::new(next_id),
        })
    }

    /// Writes a batch of records to a new segment and registers it at the
    /// newest position. The batch is sorted by key here; an empty batch is a
    /// no-op. Registration is atomic: readers see the registry either with or
    /// without the new segment, never in between.
    pub fn flush(&self, mut records: Vec<Record>) -> Result<Option<Arc<Segment>>> {
        if records.is_empty() {
            return Ok(None);
        }
        records.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{:06}.{}", id, SEGMENT_EXT));
        let segment = Arc::new(Segment::create(id, path, &records)?);

        self.segments.write()?.insert(0, segment.clone());
        Ok(Some(segment))
    }

    /// Searches for a key across segments, newest first, skipping segments
    /// whose key range excludes it. The first segment holding the key decides
    /// the outcome: a tombstone means the key is absent and older segments
    /// are not consulted. An I/O failure propagates for the same reason; it
    /// signals a corrupt or missing file, and falling through to older data
    /// would hide it.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let segments = self.snapshot();

        for segment in &segments {
            if !segment.contains(key) {
                continue;
            }
            if let Some(record) = segment.get(key)? {
                if record.tombstone {
                    return Ok(None);
                }
                return Ok(Some(record.value));
            }
        }
        Ok(None)
    }

    /// Drops a segment from the registry and unlinks its file.
    pub fn remove(&self, segment: &Arc<Segment>) -> Result<()> {
        self.segments.write()?.retain(|s| s.id() != segment.id());
        std::fs::remove_file(segment.path())?;
        Ok(())
    }

    /// A point-in-time copy of the registry, newest first.
    pub fn snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments
            .read()
            .map(|segments| segments.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.segments.read().map(|s| s.len()).unwrap_or(0)
    }
}
