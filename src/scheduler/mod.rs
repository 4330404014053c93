//! Timer-driven background tasks with graceful shutdown.

use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

/// A task run periodically by the [`Scheduler`]. Execution errors are logged
/// and do not stop the timer loop.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute one tick of the task
    async fn execute(&self) -> Result<()>;
}

/// Owns the timer loops for registered tasks. Shutdown is signalled over the
/// broadcast channel shared with the rest of the engine; each loop exits at
/// its next iteration.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            handles: Vec::new(),
            shutdown_tx,
        }
    }

    /// Registers a periodic task. The first tick fires one full interval
    /// after registration.
    pub fn register<T: BackgroundTask + 'static>(&mut self, task: Arc<T>) {
        let period = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(task = task.name(), error = %e, "task execution failed");
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        });

        self.handles.push(handle);
    }

    /// Waits for every task loop to observe shutdown and exit. The shutdown
    /// signal itself is sent by the owner of the broadcast channel.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TickTask {
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TickTask {
        fn name(&self) -> &'static str {
            "tick"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn execute(&self) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_ticks_and_shuts_down() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut scheduler = Scheduler::new(shutdown_tx.clone());
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TickTask {
            counter: counter.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(counter.load(Ordering::SeqCst) > 0);

        shutdown_tx.send(()).unwrap();
        scheduler.join().await;

        let settled = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), settled);
    }
}
