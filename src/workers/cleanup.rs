//! Retention cleanup worker.

use crate::db::Store;
use crate::queue::{CleanupJob, CleanupKind, Job, JobError, JobHandler, QueueName};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Consumer of the cleanup queue.
pub struct CleanupWorker {
    store: Arc<Store>,
}

impl CleanupWorker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Delete rows older than `job.older_than` days. Returns rows removed.
    pub fn run(&self, job: &CleanupJob, now: DateTime<Utc>) -> Result<usize, JobError> {
        let cutoff = ChronoDuration::try_days(job.older_than.max(0))
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| {
                JobError::Unrecoverable(format!("olderThan out of range: {} days", job.older_than))
            })?;
        let removed = match job.kind {
            CleanupKind::OldChecks => self.store.delete_checks_before(cutoff)?,
            CleanupKind::OldMetrics => self.store.delete_metrics_before(cutoff)?,
            CleanupKind::ExpiredTokens => self.store.delete_unverified_subscribers_before(cutoff)?,
        };
        Ok(removed)
    }
}

#[async_trait]
impl JobHandler for CleanupWorker {
    fn queue(&self) -> QueueName {
        QueueName::Cleanup
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: CleanupJob = job.decode()?;
        if payload.older_than <= 0 {
            return Err(JobError::Unrecoverable(format!(
                "olderThan must be positive, got {}",
                payload.older_than
            )));
        }
        let removed = self.run(&payload, Utc::now())?;
        tracing::info!(
            "CleanupWorker: {:?} removed {} rows older than {} days",
            payload.kind,
            removed,
            payload.older_than
        );
        Ok(())
    }
}
