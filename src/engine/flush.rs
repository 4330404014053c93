//! Flush worker: drains frozen MemStores into segments.

use super::Engine;
use crate::error::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Long-lived worker loop. Wakes on the rotation signal, drains the
/// immutable queue, and exits when shutdown is broadcast.
pub(super) async fn run(engine: Arc<Engine>) {
    let mut shutdown = engine.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = engine.flush_signal.notified() => {
                if let Err(e) = drain_queue(&engine) {
                    tracing::error!(error = %e, "memstore flush failed");
                }
            }

            _ = shutdown.recv() => {
                tracing::debug!("flush worker shutting down");
                break;
            }
        }
    }
}

/// Flushes frozen MemStores, oldest first, until the queue is empty. The
/// WAL is truncated only once the queue has fully drained and the final
/// flush succeeded, so a crash during a multi-stage flush leaves every
/// in-flight mutation replayable from the log.
pub(crate) fn drain_queue(engine: &Engine) -> Result<()> {
    engine.flush_in_flight.fetch_add(1, Ordering::SeqCst);
    let result = drain_queue_inner(engine);
    engine.flush_in_flight.fetch_sub(1, Ordering::SeqCst);
    result
}

fn drain_queue_inner(engine: &Engine) -> Result<()> {
    loop {
        let (store, queue_empty) = {
            let mut stores = engine.stores.write()?;
            match stores.immutable.pop_front() {
                Some(store) => {
                    let empty = stores.immutable.is_empty();
                    (store, empty)
                }
                None => return Ok(()),
            }
        };

        // On failure the detached store is gone from memory, but truncate
        // has not run: the WAL still carries its mutations for replay.
        engine.segments.flush(store.drain())?;
        engine.counters.flushes.fetch_add(1, Ordering::Relaxed);

        if queue_empty {
            engine.wal.truncate()?;
            tracing::info!(
                segment_count = engine.segments.count(),
                "flush drained queue, WAL truncated"
            );
            return Ok(());
        }
    }
}
