//! Compaction: merges the oldest segments into one, reclaiming the space
//! held by overwritten and deleted keys and reducing the number of segments
//! a lookup has to visit.

use super::Engine;
use crate::error::Result;
use crate::memstore::Record;
use std::collections::HashMap;

/// Number of oldest segments merged per compaction cycle. No compaction
/// runs until more than this many segments exist.
pub(crate) const COMPACTION_FANIN: usize = 4;

/// One compaction cycle: snapshot the registry, merge the oldest
/// [`COMPACTION_FANIN`] segments keeping the highest-timestamped record per
/// key, write the survivors as a new segment, then remove the sources.
pub(crate) fn compact(engine: &Engine) -> Result<()> {
    let snapshot = engine.segments.snapshot();
    if snapshot.len() <= COMPACTION_FANIN {
        return Ok(());
    }
    let sources = snapshot[snapshot.len() - COMPACTION_FANIN..].to_vec();

    let mut latest: HashMap<Vec<u8>, Record> = HashMap::new();
    for segment in &sources {
        for record in segment.read_all()? {
            match latest.get(&record.key) {
                Some(existing) if existing.timestamp >= record.timestamp => {}
                _ => {
                    latest.insert(record.key.clone(), record);
                }
            }
        }
    }

    // Tombstones die here: these are the oldest segments, so no older data
    // remains that a dropped tombstone could fail to shadow. If this
    // strategy ever merges non-terminal ranges, tombstones must instead be
    // carried until they reach the oldest tier.
    let survivors: Vec<Record> = latest.into_values().filter(|r| !r.tombstone).collect();
    let merged = engine.segments.flush(survivors)?;

    for segment in &sources {
        if let Err(e) = engine.segments.remove(segment) {
            tracing::warn!(id = segment.id(), error = %e, "failed to remove compacted segment");
        }
    }

    tracing::info!(
        sources = COMPACTION_FANIN,
        merged_id = merged.as_ref().map(|s| s.id()),
        segment_count = engine.segments.count(),
        "compaction complete"
    );
    Ok(())
}
