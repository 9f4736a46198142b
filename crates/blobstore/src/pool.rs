//! Bounded worker pool for background maintenance.
//!
//! A fixed number of tokio workers drain a bounded `flume` queue. `submit`
//! waits for queue capacity, `try_submit` refuses when the queue is full.
//! Must be created from within a tokio runtime.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{BlobStoreError, Result};

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    tx: flume::Sender<Job>,
    concurrency: usize,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(name: &str, concurrency: usize, capacity: usize) -> Self {
        let concurrency = concurrency.max(1);
        let capacity = capacity.max(1);
        let name: Arc<str> = Arc::from(name);
        let (tx, rx) = flume::bounded::<Job>(capacity);

        for worker in 0..concurrency {
            let rx = rx.clone();
            let name = name.clone();
            tokio::spawn(async move {
                while let Ok(job) = rx.recv_async().await {
                    // A panicking job takes down its own task only.
                    if let Err(e) = tokio::spawn(job).await {
                        error!(pool = %name, worker, error = %e, "job panicked");
                    }
                }
                debug!(pool = %name, worker, "worker exiting");
            });
        }

        Self {
            name,
            tx,
            concurrency,
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Queue a job, waiting for room if the queue is full.
    pub async fn submit<F, T>(&self, job: F) -> Result<JobHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = self.wrap(job);
        self.tx
            .send_async(job)
            .await
            .map_err(|_| BlobStoreError::PoolClosed(self.name.to_string()))?;
        Ok(handle)
    }

    /// Queue a job, or fail with [`BlobStoreError::PoolFull`] right away.
    pub fn try_submit<F, T>(&self, job: F) -> Result<JobHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (job, handle) = self.wrap(job);
        self.tx.try_send(job).map_err(|e| match e {
            flume::TrySendError::Full(_) => BlobStoreError::PoolFull(self.name.to_string()),
            flume::TrySendError::Disconnected(_) => {
                BlobStoreError::PoolClosed(self.name.to_string())
            }
        })?;
        Ok(handle)
    }

    fn wrap<F, T>(&self, job: F) -> (Job, JobHandle<T>)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let _ = tx.send(job.await);
        }
        .boxed();
        let handle = JobHandle {
            pool: self.name.clone(),
            rx,
        };
        (job, handle)
    }
}

/// Resolves to the output of a submitted job.
#[derive(Debug)]
pub struct JobHandle<T> {
    pool: Arc<str>,
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    pub async fn join(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| BlobStoreError::JobAborted(self.pool.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_returns_job_output() {
        let pool = WorkerPool::new("test", 2, 4);
        let handle = pool.submit(async { 21 * 2 }).await.unwrap();
        assert_eq!(handle.join().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("bounded", 2, 16);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let active = active.clone();
            let peak = peak.clone();
            let handle = pool
                .submit(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            handles.push(handle);
        }
        for handle in handles {
            handle.join().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_try_submit_rejects_when_full() {
        let pool = WorkerPool::new("full", 1, 1);
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = pool
            .submit(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .await
            .unwrap();
        started_rx.await.unwrap();

        let queued = pool.try_submit(async { "queued" }).unwrap();
        assert!(matches!(
            pool.try_submit(async { "rejected" }),
            Err(BlobStoreError::PoolFull(_))
        ));

        release_tx.send(()).unwrap();
        running.join().await.unwrap();
        assert_eq!(queued.join().await.unwrap(), "queued");
    }

    #[tokio::test]
    async fn test_panicking_job_is_aborted_and_pool_survives() {
        let pool = WorkerPool::new("panics", 1, 4);
        let handle = pool
            .submit(async {
                panic!("boom");
            })
            .await
            .unwrap();
        assert!(matches!(
            handle.join().await,
            Err(BlobStoreError::JobAborted(_))
        ));

        let handle = pool.submit(async { "still alive" }).await.unwrap();
        assert_eq!(handle.join().await.unwrap(), "still alive");
    }
}
