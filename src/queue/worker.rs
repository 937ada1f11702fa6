//! Queue consumer loop.

use super::{FailOutcome, Job, JobQueue, QueueError, QueueName};
use crate::db::DbError;

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a claimed job is held before it is handed out again.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Idle poll interval when a queue is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Handler failure. Retryable errors go back to the queue with backoff;
/// unrecoverable ones go straight to the failed set.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Unrecoverable(String),
}

impl JobError {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, JobError::Unrecoverable(_))
    }
}

impl From<DbError> for JobError {
    fn from(e: DbError) -> Self {
        JobError::Retryable(format!("database error: {}", e))
    }
}

impl From<QueueError> for JobError {
    fn from(e: QueueError) -> Self {
        JobError::Retryable(format!("queue error: {}", e))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::Unrecoverable(format!("malformed job payload: {}", e))
    }
}

/// Processes jobs from one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;

    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// Runs a handler against its queue with bounded concurrency.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    lease: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, concurrency: usize) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Start consuming until `stop_rx` fires; in-flight jobs finish first.
    pub fn spawn(self, stop_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop_rx))
    }

    async fn run(self, mut stop_rx: broadcast::Receiver<()>) {
        let name = self.handler.queue();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        info!("Worker[{}]: started with concurrency {}", name, self.concurrency);

        loop {
            let permit = tokio::select! {
                _ = stop_rx.recv() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let claimed = self.queue.claim(name, self.lease).await;
            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    if self.idle(&mut stop_rx).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    error!("Worker[{}]: claim failed: {}", name, e);
                    if self.idle(&mut stop_rx).await {
                        break;
                    }
                    continue;
                }
            };

            let queue = self.queue.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process_job(queue.as_ref(), handler.as_ref(), job).await;
            });
        }

        // Wait for in-flight jobs.
        if semaphore.acquire_many(self.concurrency as u32).await.is_ok() {
            info!("Worker[{}]: drained", name);
        }
    }

    /// Sleep for the poll interval plus jitter. Returns true if stopped.
    async fn idle(&self, stop_rx: &mut broadcast::Receiver<()>) -> bool {
        let jitter = rand::thread_rng().gen_range(0..=self.poll_interval.as_millis() as u64 / 4);
        let wait = self.poll_interval + Duration::from_millis(jitter);
        tokio::select! {
            _ = stop_rx.recv() => true,
            _ = tokio::time::sleep(wait) => false,
        }
    }
}

/// Run one job through its handler and record the result.
pub async fn process_job(queue: &dyn JobQueue, handler: &dyn JobHandler, job: Job) {
    let name = job.queue;
    debug!("Worker[{}]: processing {} ({})", name, job.id, job.name);

    match handler.handle(&job).await {
        Ok(()) => {
            if let Err(e) = queue.complete(&job).await {
                error!("Worker[{}]: failed to complete {}: {}", name, job.id, e);
            }
        }
        Err(err) => {
            let reason = err.to_string();
            match queue.fail(&job, &reason, err.is_unrecoverable()).await {
                Ok(FailOutcome::Retrying { delay }) => warn!(
                    "Worker[{}]: job {} failed (attempt {}), retrying in {:?}: {}",
                    name,
                    job.id,
                    job.attempts_made + 1,
                    delay,
                    reason
                ),
                Ok(FailOutcome::Failed) => error!(
                    "Worker[{}]: job {} failed permanently: {}",
                    name, job.id, reason
                ),
                Err(e) => error!("Worker[{}]: failed to record failure of {}: {}", name, job.id, e),
            }
        }
    }
}

/// Process every job that is ready right now. Returns how many ran.
pub async fn drain(queue: &dyn JobQueue, handler: &dyn JobHandler) -> Result<usize, QueueError> {
    let mut processed = 0;
    while let Some(job) = queue.claim(handler.queue(), DEFAULT_LEASE).await? {
        process_job(queue, handler, job).await;
        processed += 1;
    }
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Backoff, JobOptions, MemoryQueue};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        seen: AtomicUsize,
        fail_with: Option<fn() -> JobError>,
    }

    #[async_trait]
    impl JobHandler for Recording {
        fn queue(&self) -> QueueName {
            QueueName::Cleanup
        }

        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }
    }

    fn handler(fail_with: Option<fn() -> JobError>) -> Recording {
        Recording {
            seen: AtomicUsize::new(0),
            fail_with,
        }
    }

    #[tokio::test]
    async fn test_drain_completes_jobs() {
        let queue = MemoryQueue::new();
        for _ in 0..3 {
            queue
                .add(QueueName::Cleanup, "cleanup-old-checks", json!({}), JobOptions::default())
                .await
                .unwrap();
        }
        let h = handler(None);
        assert_eq!(drain(&queue, &h).await.unwrap(), 3);
        assert_eq!(h.seen.load(Ordering::SeqCst), 3);

        let counts = queue.counts(QueueName::Cleanup).await.unwrap();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_goes_to_failed() {
        let queue = MemoryQueue::new();
        queue
            .add(QueueName::Cleanup, "cleanup", json!({}), JobOptions::default())
            .await
            .unwrap();
        let h = handler(Some(|| JobError::Unrecoverable("bad".into())));
        drain(&queue, &h).await.unwrap();

        assert_eq!(h.seen.load(Ordering::SeqCst), 1);
        let failed = queue.failed(QueueName::Cleanup, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_reason.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried_until_exhausted() {
        let queue = MemoryQueue::new();
        let opts = JobOptions {
            backoff: Backoff::Fixed { delay_ms: 0 },
            ..JobOptions::default()
        };
        queue.add(QueueName::Cleanup, "cleanup", json!({}), opts).await.unwrap();
        let h = handler(Some(|| JobError::Retryable("busy".into())));

        // Each zero-delay retry is ready again on the next claim.
        drain(&queue, &h).await.unwrap();
        assert_eq!(h.seen.load(Ordering::SeqCst), 3);
        assert_eq!(queue.counts(QueueName::Cleanup).await.unwrap().failed, 1);
    }

    #[test]
    fn test_error_conversions() {
        let bad: Result<u32, _> = serde_json::from_str::<u32>("\"x\"");
        let err: JobError = bad.unwrap_err().into();
        assert!(err.is_unrecoverable());

        let err: JobError = QueueError::Unavailable("down".into()).into();
        assert!(!err.is_unrecoverable());
    }

    #[tokio::test]
    async fn test_spawned_worker_stops_and_drains() {
        let queue: Arc<MemoryQueue> = Arc::new(MemoryQueue::new());
        queue
            .add(QueueName::Cleanup, "cleanup", json!({}), JobOptions::default())
            .await
            .unwrap();
        let h = Arc::new(handler(None));

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let worker = Worker::new(queue.clone(), h.clone(), 2).poll_interval(Duration::from_millis(20));
        let handle = worker.spawn(stop_rx);

        for _ in 0..50 {
            if h.seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.seen.load(Ordering::SeqCst), 1);
        tokio_test::assert_ok!(queue.counts(QueueName::Cleanup).await);
    }
}
