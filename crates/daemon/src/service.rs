//! Scheduled maintenance: compaction of every store on a fixed interval.

use std::time::Duration;

use blobstore::{CompactionCoordinator, StoreSelection};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Stops a spawned [`MaintenanceService`] after its current run.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug)]
pub struct MaintenanceService {
    coordinator: CompactionCoordinator,
    selection: StoreSelection,
    interval: Duration,
    inactivity: Duration,
}

impl MaintenanceService {
    pub fn new(coordinator: CompactionCoordinator, interval: Duration, inactivity: Duration) -> Self {
        Self {
            coordinator,
            selection: StoreSelection::All,
            interval,
            inactivity,
        }
    }

    pub fn with_selection(mut self, selection: StoreSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Run on a background task. The join handle yields the number of
    /// compaction runs attempted.
    pub fn spawn(self) -> (ShutdownHandle, JoinHandle<usize>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(rx));
        (ShutdownHandle { tx }, handle)
    }

    /// The first run happens one interval after start. A failed run is
    /// logged and retried at the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            selection = %self.selection,
            "maintenance service started"
        );
        let mut runs = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    runs += 1;
                    match self.coordinator.run(&self.selection, self.inactivity).await {
                        Ok(outcome) if outcome.is_success() => {
                            tracing::info!(message = %outcome.message, "scheduled compaction finished");
                        }
                        Ok(outcome) => {
                            tracing::warn!(message = %outcome.message, "scheduled compaction finished with failures");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "scheduled compaction skipped");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(runs, "maintenance service stopped");
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use blobstore::{BlobStoreManager, CompactionSettings, MemoryConfigurationStore, NoMoves};

    fn coordinator() -> CompactionCoordinator {
        let manager = BlobStoreManager::builder(Arc::new(MemoryConfigurationStore::new())).build();
        CompactionCoordinator::new(manager, Arc::new(NoMoves), CompactionSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_once_per_interval_until_shutdown() {
        let interval = Duration::from_secs(60);
        let (shutdown, handle) =
            MaintenanceService::new(coordinator(), interval, Duration::ZERO).spawn();

        tokio::time::sleep(interval * 3 + interval / 2).await;
        shutdown.shutdown();

        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_tick() {
        let (shutdown, handle) =
            MaintenanceService::new(coordinator(), Duration::from_secs(60), Duration::ZERO)
                .spawn();
        shutdown.shutdown();
        assert_eq!(handle.await.unwrap(), 0);
    }
}
