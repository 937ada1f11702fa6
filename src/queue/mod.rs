//! Durable job queue.
//!
//! Five logical queues share one backend. Jobs are claimed under a lease and
//! must be completed or failed by the consumer; a job whose lease runs out is
//! handed out again, so delivery is at-least-once. Failed jobs are retried
//! with backoff until their attempts run out and are then kept in a bounded
//! failed set for inspection.

mod jobs;
mod memory;
mod redis;
mod worker;

pub use jobs::*;
pub use memory::*;
pub use self::redis::*;
pub use worker::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How many failed jobs each queue keeps.
pub const FAILED_JOBS_RETAINED: usize = 500;

/// How long a completed job id blocks re-enqueueing the same id.
pub const COMPLETED_JOB_TTL: Duration = Duration::from_secs(3600);

/// Queue error types.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
}

/// The logical queues of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    StatusCheck,
    EmailNotification,
    IncidentAlert,
    MetricsAggregation,
    Cleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::StatusCheck,
        QueueName::EmailNotification,
        QueueName::IncidentAlert,
        QueueName::MetricsAggregation,
        QueueName::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::StatusCheck => "status-check",
            QueueName::EmailNotification => "email-notification",
            QueueName::IncidentAlert => "incident-alert",
            QueueName::MetricsAggregation => "metrics-aggregation",
            QueueName::Cleanup => "cleanup",
        }
    }

    /// Default priority for jobs on this queue. Lower runs first.
    pub fn default_priority(&self) -> u32 {
        match self {
            QueueName::IncidentAlert => 1,
            QueueName::StatusCheck => 2,
            QueueName::EmailNotification => 3,
            QueueName::MetricsAggregation => 5,
            QueueName::Cleanup => 10,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown queue: {}", s))
    }
}

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential { delay_ms: 1000 }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub priority: Option<u32>,
    pub delay: Option<Duration>,
    pub attempts: u32,
    pub backoff: Backoff,
    /// Explicit id; enqueueing an id that already exists is a no-op.
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: None,
            delay: None,
            attempts: 3,
            backoff: Backoff::default(),
            job_id: None,
        }
    }
}

impl JobOptions {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A job as stored by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub name: String,
    pub data: serde_json::Value,
    pub priority: u32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        queue: QueueName,
        name: &str,
        data: serde_json::Value,
        opts: &JobOptions,
    ) -> Self {
        Self {
            id: opts
                .job_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            queue,
            name: name.to_string(),
            data,
            priority: opts.priority.unwrap_or_else(|| queue.default_priority()),
            attempts_made: 0,
            max_attempts: opts.attempts.max(1),
            backoff: opts.backoff,
            created_at: Utc::now(),
            failed_reason: None,
            finished_at: None,
        }
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Record a failed attempt and decide what happens next.
    fn record_failure(&mut self, reason: &str, unrecoverable: bool) -> FailOutcome {
        self.attempts_made += 1;
        self.failed_reason = Some(reason.to_string());

        if unrecoverable || self.attempts_made >= self.max_attempts {
            self.finished_at = Some(Utc::now());
            FailOutcome::Failed
        } else {
            FailOutcome::Retrying {
                delay: self.backoff.delay_for(self.attempts_made),
            }
        }
    }
}

/// What the backend did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Failed,
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub failed: u64,
    pub completed: u64,
}

/// A registered recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub queue: QueueName,
    pub name: String,
    /// Five-field cron pattern.
    pub cron: String,
    pub data: serde_json::Value,
}

impl RepeatSpec {
    /// Registry key; registering a job under the same queue and name
    /// replaces its pattern and payload.
    pub fn key(&self) -> String {
        format!("{}:{}", self.queue, self.name)
    }
}

/// Backend operations shared by the Redis and in-memory queues.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns `false` if `opts.job_id` already exists.
    async fn add(
        &self,
        queue: QueueName,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<bool, QueueError>;

    /// Claim the next ready job, holding it for `lease`.
    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, job: &Job) -> Result<(), QueueError>;

    /// Record a failure; retries with backoff unless attempts are exhausted
    /// or `unrecoverable` is set.
    async fn fail(
        &self,
        job: &Job,
        reason: &str,
        unrecoverable: bool,
    ) -> Result<FailOutcome, QueueError>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError>;

    /// Most recently failed jobs, newest first.
    async fn failed(&self, queue: QueueName, limit: usize) -> Result<Vec<Job>, QueueError>;

    /// Move a failed job back to the wait list with fresh attempts.
    async fn retry_failed(&self, queue: QueueName, id: &str) -> Result<(), QueueError>;

    async fn register_repeat(&self, spec: &RepeatSpec) -> Result<(), QueueError>;

    async fn repeats(&self) -> Result<Vec<RepeatSpec>, QueueError>;

    /// Drop a registration by its key.
    async fn unregister_repeat(&self, key: &str) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Sort score inside the wait set: priority first, then enqueue time.
///
/// Written out as an exact decimal (the priority followed by the time padded
/// to 13 digits) so neither Rust nor Lua rounds it on the way to Redis.
fn wait_score(priority: u32, at_ms: i64) -> String {
    format!("{}{}", priority, wait_time_digits(at_ms))
}

/// Enqueue time as the fixed-width tail of a wait score.
fn wait_time_digits(at_ms: i64) -> String {
    format!("{:013}", at_ms.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));

        let fixed = Backoff::Fixed { delay_ms: 250 };
        assert_eq!(fixed.delay_for(5), Duration::from_millis(250));
    }

    #[test]
    fn test_queue_names_roundtrip() {
        for q in QueueName::ALL {
            assert_eq!(q.as_str().parse::<QueueName>().unwrap(), q);
            assert_eq!(
                serde_json::to_value(q).unwrap(),
                serde_json::Value::String(q.as_str().to_string())
            );
        }
        assert!("emails".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_record_failure_exhausts_attempts() {
        let mut job = Job::new(
            QueueName::EmailNotification,
            "send",
            serde_json::json!({}),
            &JobOptions::default(),
        );
        assert_eq!(
            job.record_failure("boom", false),
            FailOutcome::Retrying { delay: Duration::from_secs(1) }
        );
        assert_eq!(
            job.record_failure("boom", false),
            FailOutcome::Retrying { delay: Duration::from_secs(2) }
        );
        assert_eq!(job.record_failure("boom", false), FailOutcome::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unrecoverable_failure_skips_retries() {
        let mut job = Job::new(
            QueueName::EmailNotification,
            "send",
            serde_json::json!({}),
            &JobOptions::default(),
        );
        assert_eq!(job.record_failure("bad payload", true), FailOutcome::Failed);
        assert_eq!(job.attempts_made, 1);
    }

    #[test]
    fn test_wait_score_orders_priority_before_time() {
        let score = |p, t| wait_score(p, t).parse::<f64>().unwrap();
        assert!(score(1, 2_000_000_000_000) < score(2, 1_000_000_000_000));
        assert!(score(3, 1) < score(3, 2));
        assert_eq!(wait_score(10, 1_717_000_000_123), "101717000000123");
    }

    #[test]
    fn test_wait_score_keeps_millisecond_order_for_low_priority() {
        let score = |t| wait_score(10, t).parse::<f64>().unwrap();
        let now = 1_717_000_000_123;
        assert!(score(now) < score(now + 1));
        assert_eq!(score(now), 10.0 * 1e13 + now as f64);
        assert_eq!(wait_score(10, now), format!("10{}", wait_time_digits(now)));
    }
}
