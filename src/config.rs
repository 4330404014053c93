use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database files (WAL and segments).
    pub data_dir: PathBuf,

    /// Maximum size of the active MemStore before rotation (default: 64MB)
    pub memstore_max_size: usize,

    /// How often the compaction worker runs (default: 5min)
    pub compaction_interval: Duration,

    /// How often the WAL is synced to stable storage (default: 100ms)
    pub wal_sync_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            memstore_max_size: 64 * 1024 * 1024, // 64MB
            compaction_interval: Duration::from_secs(5 * 60),
            wal_sync_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Create a new config with the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum MemStore size
    pub fn memstore_max_size(mut self, size: usize) -> Self {
        self.memstore_max_size = size;
        self
    }

    /// Set compaction interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set WAL sync interval
    pub fn wal_sync_interval(mut self, interval: Duration) -> Self {
        self.wal_sync_interval = interval;
        self
    }
}
