//! Recurring job scheduler.
//!
//! At startup the recurring jobs are registered with the queue backend once.
//! A driver then wakes every few seconds and, for every registered job whose
//! cron pattern fired since the previous wake, enqueues one job with an id
//! derived from the fire time. Several replicas can run the driver; the
//! queue drops the duplicate ids.

use crate::queue::{
    CleanupJob, CleanupKind, JobOptions, JobQueue, MetricsAggregationJob, MetricsPeriod,
    QueueError, QueueName, RepeatSpec, StatusCheckJob,
};

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Retention for hourly and daily metric rows.
pub const METRICS_RETENTION_DAYS: i64 = 365;

/// Age at which unverified subscriptions are dropped.
pub const UNVERIFIED_SUBSCRIBER_DAYS: i64 = 7;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Schedule configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid cron pattern {pattern:?}: {message}")]
    Cron { pattern: String, message: String },
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Parse a five-field cron pattern (minute precision).
pub fn parse_cron(pattern: &str) -> Result<Schedule, ConfigError> {
    let fields = pattern.split_whitespace().count();
    let full = if fields == 5 {
        format!("0 {}", pattern)
    } else {
        pattern.to_string()
    };
    Schedule::from_str(&full).map_err(|e| ConfigError::Cron {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn repeat<T: Serialize>(queue: QueueName, name: &str, cron: &str, data: &T) -> Result<RepeatSpec, ConfigError> {
    Ok(RepeatSpec {
        queue,
        name: name.to_string(),
        cron: cron.to_string(),
        data: serde_json::to_value(data)?,
    })
}

/// The recurring jobs of the pipeline.
pub fn default_schedules(check_retention_days: i64) -> Result<Vec<RepeatSpec>, ConfigError> {
    Ok(vec![
        repeat(QueueName::StatusCheck, "check-all", "* * * * *", &StatusCheckJob::cron())?,
        repeat(
            QueueName::MetricsAggregation,
            "aggregate-hourly",
            "0 * * * *",
            &MetricsAggregationJob { service_id: None, period: MetricsPeriod::Hourly },
        )?,
        repeat(
            QueueName::MetricsAggregation,
            "aggregate-daily",
            "0 0 * * *",
            &MetricsAggregationJob { service_id: None, period: MetricsPeriod::Daily },
        )?,
        repeat(
            QueueName::Cleanup,
            "cleanup-old-checks",
            "0 2 * * *",
            &CleanupJob { kind: CleanupKind::OldChecks, older_than: check_retention_days },
        )?,
        repeat(
            QueueName::Cleanup,
            "cleanup-old-metrics",
            "0 2 * * *",
            &CleanupJob { kind: CleanupKind::OldMetrics, older_than: METRICS_RETENTION_DAYS },
        )?,
        repeat(
            QueueName::Cleanup,
            "cleanup-expired-tokens",
            "0 2 * * *",
            &CleanupJob { kind: CleanupKind::ExpiredTokens, older_than: UNVERIFIED_SUBSCRIBER_DAYS },
        )?,
    ])
}

/// Drives registered recurring jobs onto their queues.
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    entries: Vec<(RepeatSpec, Schedule)>,
}

impl Scheduler {
    /// Register `specs` with the backend, drop registrations that are no
    /// longer in `specs`, and build a driver for every registered job.
    pub async fn bootstrap(queue: Arc<dyn JobQueue>, specs: &[RepeatSpec]) -> Result<Self, ConfigError> {
        for spec in specs {
            parse_cron(&spec.cron)?;
            queue.register_repeat(spec).await?;
        }

        let wanted: HashSet<String> = specs.iter().map(RepeatSpec::key).collect();
        let mut entries = Vec::new();
        for spec in queue.repeats().await? {
            if !wanted.contains(&spec.key()) {
                tracing::info!("Scheduler: removing stale recurring job {}", spec.key());
                queue.unregister_repeat(&spec.key()).await?;
                continue;
            }
            let schedule = parse_cron(&spec.cron)?;
            entries.push((spec, schedule));
        }

        tracing::info!("Scheduler: {} recurring jobs registered", entries.len());
        Ok(Self { queue, entries })
    }

    /// Enqueue every job that fired in `(from, to]`. Returns how many were new.
    pub async fn tick(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize, ConfigError> {
        let mut added = 0;
        for (spec, schedule) in &self.entries {
            for fire in schedule.after(&from).take_while(|t| *t <= to) {
                let opts = JobOptions::default().with_id(format!("repeat:{}:{}", spec.name, fire.timestamp()));
                if self
                    .queue
                    .add(spec.queue, &spec.name, spec.data.clone(), opts)
                    .await?
                {
                    tracing::debug!("Scheduler: enqueued {} for {}", spec.name, fire);
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Run the driver until `stop_rx` fires.
    pub fn start(self, mut stop_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = Utc::now();
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        match self.tick(last, now).await {
                            Ok(_) => last = now,
                            Err(e) => tracing::error!("Scheduler: tick failed: {}", e),
                        }
                    }
                }
            }
            tracing::info!("Scheduler: stopped");
        })
    }
}
