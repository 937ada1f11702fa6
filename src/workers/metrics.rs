//! Metrics aggregation worker.
//!
//! The status sweep folds every check into its hourly bucket as it goes.
//! This worker recounts closed hours from the check rows, rolls finished
//! days into daily metrics and refreshes rolling uptime.

use super::status::refresh_uptime;
use crate::db::{truncate_to_day, truncate_to_hour, DbError, Store};
use crate::queue::{Job, JobError, JobHandler, MetricsAggregationJob, MetricsPeriod, QueueName};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

/// Consumer of the metrics-aggregation queue.
pub struct MetricsWorker {
    store: Arc<Store>,
}

impl MetricsWorker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Aggregate `period` as of `now`. Returns how many services were processed.
    pub fn aggregate(&self, job: &MetricsAggregationJob, now: DateTime<Utc>) -> Result<usize, DbError> {
        let service_ids = match job.service_id {
            Some(id) => vec![id],
            None => self
                .store
                .list_services()?
                .into_iter()
                .map(|s| s.id)
                .collect(),
        };

        for &id in &service_ids {
            match job.period {
                MetricsPeriod::Hourly => {
                    let hour = truncate_to_hour(now) - ChronoDuration::hours(1);
                    self.store.reconcile_metric_bucket(id, hour)?;
                }
                MetricsPeriod::Daily => {
                    let day = truncate_to_day(now) - ChronoDuration::days(1);
                    if let Some(metric) = self.store.roll_up_day(id, day)? {
                        tracing::debug!(
                            "MetricsWorker: service {} day {} uptime {:.2}%",
                            id,
                            day.format("%Y-%m-%d"),
                            metric.uptime_percent
                        );
                    }
                    refresh_uptime(&self.store, id, now)?;
                }
                MetricsPeriod::Weekly | MetricsPeriod::Monthly => {
                    refresh_uptime(&self.store, id, now)?;
                }
            }
        }

        Ok(service_ids.len())
    }
}

#[async_trait]
impl JobHandler for MetricsWorker {
    fn queue(&self) -> QueueName {
        QueueName::MetricsAggregation
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: MetricsAggregationJob = job.decode()?;
        let count = self.aggregate(&payload, Utc::now())?;
        tracing::info!(
            "MetricsWorker: {:?} aggregation done for {} services",
            payload.period,
            count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Check, HealthStatus};
    use crate::workers::testing::add_service;
    use chrono::TimeZone;

    fn check(store: &Store, service_id: i64, status: HealthStatus, at: DateTime<Utc>) {
        store
            .add_check(&Check {
                id: 0,
                service_id,
                status,
                response_time_ms: Some(100),
                status_code: Some(200),
                error: None,
                source: "cron".to_string(),
                created_at: at,
            })
            .unwrap();
    }

    #[test]
    fn test_hourly_reconciles_previous_hour() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = add_service(&store, "api", None);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 11, 5, 0).unwrap();
        let prev = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        check(&store, service.id, HealthStatus::Operational, prev + ChronoDuration::minutes(1));
        check(&store, service.id, HealthStatus::Operational, prev + ChronoDuration::minutes(2));
        check(&store, service.id, HealthStatus::MajorOutage, prev + ChronoDuration::minutes(3));

        let worker = MetricsWorker::new(store.clone());
        let job = MetricsAggregationJob {
            service_id: None,
            period: MetricsPeriod::Hourly,
        };
        assert_eq!(worker.aggregate(&job, now).unwrap(), 1);

        let bucket = store.get_metric_bucket(service.id, prev).unwrap().unwrap();
        assert_eq!(bucket.checks_total, 3);
        assert_eq!(bucket.checks_success, 2);
        assert_eq!(bucket.checks_failed, 1);
    }

    #[test]
    fn test_daily_rolls_up_and_refreshes_uptime() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = add_service(&store, "api", None);
        let now = Utc::now();
        let yesterday = truncate_to_day(now) - ChronoDuration::days(1);

        for hour in 0..4 {
            let at = yesterday + ChronoDuration::hours(hour) + ChronoDuration::minutes(5);
            let status = if hour == 0 { HealthStatus::Degraded } else { HealthStatus::Operational };
            check(&store, service.id, status, at);
            store.record_metric(service.id, at, status.is_operational(), Some(100)).unwrap();
        }

        let worker = MetricsWorker::new(store.clone());
        let job = MetricsAggregationJob {
            service_id: Some(service.id),
            period: MetricsPeriod::Daily,
        };
        worker.aggregate(&job, now).unwrap();

        let stored = store.get_service(service.id).unwrap();
        assert!((stored.uptime_week - 75.0).abs() < 1e-9);
        assert!((stored.uptime_month - 75.0).abs() < 1e-9);
    }
}
