//! The storage engine facade.
//!
//! `Engine` coordinates the layered stores and their workers:
//!
//! ```text
//! put/delete ──> WAL append ──> active MemStore ──(full)──> immutable queue
//!                                                                │
//!                                                          flush worker
//!                                                                │
//!                                                                v
//! get ─────> active ─> immutables (newest first) ─> segments (newest first)
//! ```
//!
//! A write is appended to the WAL, applied to the active MemStore under the
//! engine lock, and rotates the MemStore into the immutable queue when it
//! fills. A read probes the layers newest to oldest; the first hit wins, and
//! a tombstone anywhere terminates the search as "absent".
//!
//! Three background workers run alongside client operations: the flush
//! worker (signal-driven), the compaction timer and the WAL sync timer. All
//! of them observe the shutdown broadcast and exit at their next iteration.

mod compaction;
mod flush;
mod tasks;

use crate::config::Config;
use crate::error::Result;
use crate::flock::FileLock;
use crate::memstore::{next_timestamp, validate_key, MemStore, Record};
use crate::scheduler::Scheduler;
use crate::segment::SegmentSet;
use crate::wal::{Wal, WAL_FILE};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

const LOCK_FILE: &str = "emberkv.lock";

/// The active MemStore plus the frozen ones awaiting flush, oldest at the
/// front. Guarded as one unit so rotation is atomic with respect to readers:
/// they see the record either in the active store or in the queue, never in
/// neither.
struct StoreSet {
    active: Arc<MemStore>,
    immutable: VecDeque<Arc<MemStore>>,
}

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    reads: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub writes: u64,
    pub reads: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub memstore_size: usize,
    pub segment_count: usize,
    pub wal_size: u64,
}

pub struct Engine {
    config: Config,
    stores: RwLock<StoreSet>,
    wal: Arc<Wal>,
    segments: Arc<SegmentSet>,
    counters: Counters,
    flush_signal: Notify,
    flush_in_flight: AtomicUsize,
    shutdown_tx: broadcast::Sender<()>,
    scheduler: Mutex<Option<Scheduler>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    dir_lock: Mutex<Option<FileLock>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("segment_count", &self.segments.count())
            .finish()
    }
}

impl Engine {
    /// Opens the engine: locks the data directory, recovers the segment
    /// registry, replays the WAL into a fresh active MemStore, and starts
    /// the background workers. Must be called within a tokio runtime.
    ///
    /// Startup only fails for an unusable or already-locked data directory;
    /// partial data is preferred over refusal.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let dir_lock = FileLock::lock(config.data_dir.join(LOCK_FILE))?;

        let segments = Arc::new(SegmentSet::recover(&config.data_dir)?);
        let wal = Arc::new(Wal::open(config.data_dir.join(WAL_FILE))?);

        // Replay records verbatim, tombstones included: a delete whose key
        // now lives only in a segment must still materialize its tombstone,
        // or the key would resurrect. Last-writer-wins by timestamp makes a
        // double replay equivalent to a single one.
        let active = Arc::new(MemStore::new(config.memstore_max_size));
        let mut replayed = 0u64;
        for record in wal.replay()? {
            match record {
                Ok(record) => {
                    active.apply(record)?;
                    replayed += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WAL replay stopped early");
                    break;
                }
            }
        }
        if replayed > 0 {
            tracing::info!(records = replayed, "replayed WAL into memstore");
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let engine = Arc::new(Self {
            stores: RwLock::new(StoreSet {
                active,
                immutable: VecDeque::new(),
            }),
            wal,
            segments,
            counters: Counters::default(),
            flush_signal: Notify::new(),
            flush_in_flight: AtomicUsize::new(0),
            shutdown_tx,
            scheduler: Mutex::new(None),
            flusher: Mutex::new(None),
            dir_lock: Mutex::new(Some(dir_lock)),
            config,
        });

        let mut scheduler = Scheduler::new(engine.shutdown_tx.clone());
        scheduler.register(Arc::new(tasks::CompactionTask::new(engine.clone())));
        scheduler.register(Arc::new(tasks::WalSyncTask::new(engine.clone())));
        *engine.scheduler.lock()? = Some(scheduler);
        *engine.flusher.lock()? = Some(tokio::spawn(flush::run(engine.clone())));

        tracing::info!(
            dir = %engine.config.data_dir.display(),
            segment_count = engine.segments.count(),
            "engine started"
        );
        Ok(engine)
    }

    /// Writes a key-value pair. The WAL record and the MemStore entry carry
    /// the same timestamp, stamped here, so replay reconstructs the same
    /// visible order even though the append happens outside the engine lock.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        validate_key(key)?;

        let record = Record::put(key.to_vec(), value, next_timestamp());
        self.wal.append(&record)?;

        let mut stores = self.stores.write()?;
        stores.active.apply(record)?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        if stores.active.is_full() {
            self.rotate(&mut stores)?;
        }
        Ok(())
    }

    /// Retrieves the value for a key, or None when absent or tombstoned.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.lookup(key)
    }

    /// Deletes a key. A key with no visible value returns false and is not
    /// logged: the probe-then-log semantic means deleting a never-written
    /// key leaves no trace in the WAL. The existence probe deliberately does
    /// not count as a read.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        if self.lookup(key)?.is_none() {
            return Ok(false);
        }

        let record = Record::tombstone(key.to_vec(), next_timestamp());
        self.wal.append(&record)?;

        let mut stores = self.stores.write()?;
        stores.active.apply(record)?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        if stores.active.is_full() {
            self.rotate(&mut stores)?;
        }
        Ok(true)
    }

    /// All keys visible across the active and immutable MemStores. Segment
    /// contents are not enumerated.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let stores = self.stores.read()?;
        let mut keys: HashSet<Vec<u8>> = stores.active.keys().into_iter().collect();
        for store in &stores.immutable {
            keys.extend(store.keys());
        }
        Ok(keys.into_iter().collect())
    }

    /// Values of keys starting with the prefix, across the active and
    /// immutable MemStores only, de-duplicated by value bytes.
    pub fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let stores = self.stores.read()?;
        let mut values: HashSet<Vec<u8>> = stores.active.prefix_scan(prefix).into_iter().collect();
        for store in &stores.immutable {
            values.extend(store.prefix_scan(prefix));
        }
        Ok(values.into_iter().collect())
    }

    /// Snapshot of the engine counters and sizes.
    pub fn stats(&self) -> Result<Stats> {
        let memstore_size = self.stores.read()?.active.size();
        Ok(Stats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            memstore_size,
            segment_count: self.segments.count(),
            wal_size: self.wal.size(),
        })
    }

    /// Shuts down gracefully: stops the workers, persists everything still
    /// in memory to segments, and closes the WAL.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.join_workers().await?;

        // Oldest cohort first, the active store last, so segment ids keep
        // reflecting write order.
        let pending = {
            let mut stores = self.stores.write()?;
            let mut pending: Vec<Arc<MemStore>> = stores.immutable.drain(..).collect();
            let active = std::mem::replace(
                &mut stores.active,
                Arc::new(MemStore::new(self.config.memstore_max_size)),
            );
            pending.push(active);
            pending
        };
        for store in pending {
            if store.is_empty() {
                continue;
            }
            if let Err(e) = self.segments.flush(store.drain()) {
                tracing::error!(error = %e, "final flush failed, WAL retains the data");
            }
        }

        self.wal.close()?;
        self.dir_lock.lock()?.take();
        tracing::info!("engine closed");
        Ok(())
    }

    /// Probes the layered stores without touching the read counter.
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        {
            let stores = self.stores.read()?;
            if let Some(record) = stores.active.get(key) {
                return Ok(visible(record));
            }
            // Newest frozen store first.
            for store in stores.immutable.iter().rev() {
                if let Some(record) = store.get(key) {
                    return Ok(visible(record));
                }
            }
        }
        self.segments.get(key)
    }

    /// Freezes the active MemStore into the immutable queue, installs a
    /// fresh one and signals the flush worker. The notify permit coalesces
    /// repeated signals. Callers hold the engine write lock.
    fn rotate(&self, stores: &mut StoreSet) -> Result<()> {
        stores.active.freeze()?;
        let frozen = std::mem::replace(
            &mut stores.active,
            Arc::new(MemStore::new(self.config.memstore_max_size)),
        );
        tracing::debug!(size = frozen.size(), "rotating memstore");
        stores.immutable.push_back(frozen);
        self.flush_signal.notify_one();
        Ok(())
    }

    async fn join_workers(&self) -> Result<()> {
        let flusher = self.flusher.lock()?.take();
        if let Some(handle) = flusher {
            handle.await?;
        }
        let scheduler = self.scheduler.lock()?.take();
        if let Some(scheduler) = scheduler {
            scheduler.join().await;
        }
        Ok(())
    }

    /// Test support: waits until every rotated MemStore has landed in a
    /// segment — the queue is empty and no flush cycle is mid-air — so
    /// subsequent lookups and segment counts are deterministic.
    #[cfg(test)]
    pub(crate) async fn settle(&self) {
        for _ in 0..500 {
            let queue_empty = self
                .stores
                .read()
                .map(|s| s.immutable.is_empty())
                .unwrap_or(false);
            if queue_empty && self.flush_in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("flush queue did not settle");
    }

    /// Simulates an abrupt crash: workers stop, nothing in memory is
    /// flushed, the WAL is left exactly as the last sync put it, and the
    /// directory lock is released so a new engine can take over.
    #[cfg(test)]
    pub(crate) async fn abort(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.join_workers().await?;
        // Stand-in for the syncer tick that preceded the crash.
        self.wal.sync()?;
        self.dir_lock.lock()?.take();
        Ok(())
    }
}

fn visible(record: Record) -> Option<Vec<u8>> {
    if record.tombstone {
        None
    } else {
        Some(record.value)
    }
}
