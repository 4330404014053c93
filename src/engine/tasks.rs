//! Timer-driven engine tasks registered with the scheduler.

use super::{compaction, Engine};
use crate::error::Result;
use crate::scheduler::BackgroundTask;
use std::sync::Arc;
use std::time::Duration;

pub(super) struct CompactionTask {
    engine: Arc<Engine>,
}

impl CompactionTask {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.engine.config.compaction_interval
    }

    async fn execute(&self) -> Result<()> {
        compaction::compact(&self.engine)
    }
}

pub(super) struct WalSyncTask {
    engine: Arc<Engine>,
}

impl WalSyncTask {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for WalSyncTask {
    fn name(&self) -> &'static str {
        "wal-sync"
    }

    fn interval(&self) -> Duration {
        self.engine.config.wal_sync_interval
    }

    async fn execute(&self) -> Result<()> {
        self.engine.wal.sync()
    }
}
