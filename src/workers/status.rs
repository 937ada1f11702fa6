//! Status sweep and the per-service incident state machine.

use crate::db::{Check, HealthStatus, Incident, NewIncident, Service, Severity, Store};
use crate::probe::{CheckResult, Probe};
use crate::queue::{
    enqueue, AlertKind, IncidentAlertJob, Job, JobError, JobHandler, JobOptions, JobQueue,
    QueueName, StatusCheckJob, TargetedCheck,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const RECOVERY_MESSAGE: &str = "Service has recovered and is operating normally.";

/// Knobs for behaviour that is a policy choice rather than a fixed rule.
#[derive(Debug, Clone, Copy)]
pub struct StatusOptions {
    /// Raise an open incident's severity when a service gets worse without
    /// passing through OPERATIONAL, and send an "updated" alert.
    pub escalate_severity: bool,
    /// Skip a sweep while another sweep in this process is still running.
    pub skip_overlapping: bool,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            escalate_severity: false,
            skip_overlapping: true,
        }
    }
}

/// Severity of an automatically opened incident.
pub fn severity_for(status: HealthStatus) -> Severity {
    match status {
        HealthStatus::MajorOutage => Severity::Critical,
        _ => Severity::Major,
    }
}

/// What one service check changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Opened(i64),
    Resolved(i64),
    Escalated(i64),
    /// Status changed but no incident was opened, closed or escalated.
    Lateral,
}

/// Consumer of the status-check queue.
pub struct StatusWorker {
    store: Arc<Store>,
    queue: Arc<dyn JobQueue>,
    probe: Arc<dyn Probe>,
    options: StatusOptions,
    sweep_lock: Mutex<()>,
}

impl StatusWorker {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<dyn JobQueue>,
        probe: Arc<dyn Probe>,
        options: StatusOptions,
    ) -> Self {
        Self {
            store,
            queue,
            probe,
            options,
            sweep_lock: Mutex::new(()),
        }
    }

    /// Check every public service, then refresh rolling uptime.
    ///
    /// Returns the number of services checked. One failing service does not
    /// stop the sweep of the others, but any failure fails the sweep so the
    /// queue retries it; a retried sweep picks up interrupted transitions.
    pub async fn sweep(&self) -> Result<usize, JobError> {
        let _guard = if self.options.skip_overlapping {
            match self.sweep_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::warn!("StatusWorker: previous sweep still running, skipping");
                    return Ok(0);
                }
            }
        } else {
            self.sweep_lock.lock().await
        };

        let services = self.store.list_public_services()?;
        let mut failures = 0;
        let mut last_error = None;

        for service in &services {
            if let Err(e) = self.check_service(service, "cron").await {
                tracing::error!("StatusWorker: check of {} failed: {}", service.slug, e);
                failures += 1;
                last_error = Some(e);
            }
        }

        let now = Utc::now();
        for service in &services {
            if let Err(e) = refresh_uptime(&self.store, service.id, now) {
                tracing::error!("StatusWorker: uptime refresh for {} failed: {}", service.slug, e);
            }
        }

        tracing::debug!(
            "StatusWorker: swept {} services ({} failed)",
            services.len(),
            failures
        );

        match last_error {
            Some(e) => Err(e),
            None => Ok(services.len()),
        }
    }

    /// Check a single service on request.
    pub async fn check_targeted(&self, target: &TargetedCheck) -> Result<Transition, JobError> {
        let mut service = match self.store.get_service(target.service_id) {
            Ok(service) => service,
            Err(crate::db::DbError::NotFound) => {
                return Err(JobError::Unrecoverable(format!(
                    "service {} ({}) not found",
                    target.service_id, target.service_slug
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if service.url.is_none() {
            service.url = target.url.clone();
        }
        if target.timeout > 0 {
            service.timeout_seconds = target.timeout;
        }
        self.check_service(&service, "targeted").await
    }

    /// Probe one service, record the outcome and drive its incident.
    pub async fn check_service(&self, service: &Service, source: &str) -> Result<Transition, JobError> {
        let timeout = Duration::from_secs(service.timeout_seconds.max(1) as u64);
        let result = self.probe.check(service.url.as_deref(), timeout).await;
        let now = Utc::now();

        self.store.add_check(&Check {
            id: 0,
            service_id: service.id,
            status: result.status,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            error: result.error.clone(),
            source: source.to_string(),
            created_at: now,
        })?;
        self.store.record_metric(
            service.id,
            now,
            result.status.is_operational(),
            result.response_time_ms,
        )?;

        let previous = service.status;
        if previous == result.status {
            self.store.touch_service(service.id, now, result.response_time_ms)?;
            return Ok(Transition::Unchanged);
        }

        // The stored status only moves once the incident and its alert are
        // written, so a failed attempt is redone by the next one.
        let transition = if previous.is_operational() {
            self.open_incident(service, &result, now).await?
        } else if result.status.is_operational() {
            self.resolve_incident(service, now).await?
        } else {
            self.lateral(service, &result, now).await?
        };

        self.store
            .update_service_status(service.id, result.status, now, result.response_time_ms)?;
        tracing::info!(
            "StatusWorker: {} changed {} -> {}",
            service.slug,
            previous,
            result.status
        );
        Ok(transition)
    }

    async fn open_incident(
        &self,
        service: &Service,
        result: &CheckResult,
        now: DateTime<Utc>,
    ) -> Result<Transition, JobError> {
        let error = result.error.as_deref().unwrap_or("Unknown error");
        let message = format!("Automated detection: {}", error);

        if let Some(existing) = self.store.find_open_incident(service.id)? {
            return self.resume_opened(service, existing, message).await;
        }

        let severity = severity_for(result.status);
        let title = match result.status {
            HealthStatus::MajorOutage => format!("{} major outage", service.name),
            _ => format!("{} degraded performance", service.name),
        };

        let new = NewIncident {
            service_id: Some(service.id),
            title: title.clone(),
            description: format!("Automated monitoring detected an issue with {}: {}", service.name, error),
            severity,
            impact_start: now,
            automated: true,
        };
        let Some(incident) = self.store.open_incident(&new, &message)? else {
            // Another sweep opened one first.
            return match self.store.find_open_incident(service.id)? {
                Some(existing) => self.resume_opened(service, existing, message).await,
                None => Ok(Transition::Lateral),
            };
        };
        tracing::warn!(
            "StatusWorker: opened incident {} for {} ({})",
            incident.id,
            service.slug,
            severity
        );

        self.alert(IncidentAlertJob {
            incident_id: incident.id,
            kind: AlertKind::Created,
            severity,
            service_name: Some(service.name.clone()),
            title,
            message,
        })
        .await?;
        Ok(Transition::Opened(incident.id))
    }

    /// An open incident already exists while the service is still stored as
    /// operational. If the sweep opened it, an earlier attempt stopped before
    /// its alert was queued; queue it again under the same id.
    async fn resume_opened(
        &self,
        service: &Service,
        existing: Incident,
        message: String,
    ) -> Result<Transition, JobError> {
        if !existing.automated {
            return Ok(Transition::Lateral);
        }
        self.alert(IncidentAlertJob {
            incident_id: existing.id,
            kind: AlertKind::Created,
            severity: existing.severity,
            service_name: Some(service.name.clone()),
            title: existing.title,
            message,
        })
        .await?;
        Ok(Transition::Opened(existing.id))
    }

    async fn resolve_incident(&self, service: &Service, now: DateTime<Utc>) -> Result<Transition, JobError> {
        let Some(incident) = self.store.find_open_incident(service.id)? else {
            return self.resume_resolved(service).await;
        };
        if !self.store.resolve_incident(incident.id, now, RECOVERY_MESSAGE)? {
            return Ok(Transition::Lateral);
        }
        tracing::info!("StatusWorker: resolved incident {} for {}", incident.id, service.slug);

        self.alert(IncidentAlertJob {
            incident_id: incident.id,
            kind: AlertKind::Resolved,
            severity: incident.severity,
            service_name: Some(service.name.clone()),
            title: incident.title,
            message: RECOVERY_MESSAGE.to_string(),
        })
        .await?;
        Ok(Transition::Resolved(incident.id))
    }

    /// No open incident on recovery. If the sweep resolved one since the
    /// service went down, an earlier attempt stopped before its alert was
    /// queued; queue it again under the same id.
    async fn resume_resolved(&self, service: &Service) -> Result<Transition, JobError> {
        let Some(latest) = self.store.find_latest_incident(service.id)? else {
            return Ok(Transition::Lateral);
        };
        let resolved_since_down = match (latest.resolved_at, service.last_status_change) {
            (Some(resolved), Some(down)) => resolved >= down,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !latest.automated || !resolved_since_down {
            return Ok(Transition::Lateral);
        }
        let recovered = self
            .store
            .get_incident_detail(latest.id)?
            .and_then(|d| d.latest_update)
            .is_some_and(|u| u.message == RECOVERY_MESSAGE);
        if !recovered {
            return Ok(Transition::Lateral);
        }

        self.alert(IncidentAlertJob {
            incident_id: latest.id,
            kind: AlertKind::Resolved,
            severity: latest.severity,
            service_name: Some(service.name.clone()),
            title: latest.title,
            message: RECOVERY_MESSAGE.to_string(),
        })
        .await?;
        Ok(Transition::Resolved(latest.id))
    }

    async fn lateral(
        &self,
        service: &Service,
        result: &CheckResult,
        now: DateTime<Utc>,
    ) -> Result<Transition, JobError> {
        if !self.options.escalate_severity {
            return Ok(Transition::Lateral);
        }
        let Some(incident) = self.store.find_open_incident(service.id)? else {
            return Ok(Transition::Lateral);
        };

        let severity = severity_for(result.status);
        if severity <= incident.severity {
            return Ok(Transition::Lateral);
        }

        let message = format!(
            "Severity raised to {}: {}",
            severity,
            result.error.as_deref().unwrap_or("status worsened")
        );
        if !self.store.escalate_incident(incident.id, severity, &message, now)? {
            return Ok(Transition::Lateral);
        }

        self.alert(IncidentAlertJob {
            incident_id: incident.id,
            kind: AlertKind::Updated,
            severity,
            service_name: Some(service.name.clone()),
            title: incident.title,
            message,
        })
        .await?;
        Ok(Transition::Escalated(incident.id))
    }

    async fn alert(&self, job: IncidentAlertJob) -> Result<(), JobError> {
        // One alert per incident event, even if this sweep is retried.
        let id = match job.kind {
            AlertKind::Updated => format!("incident:{}:updated:{}", job.incident_id, job.severity),
            kind => format!("incident:{}:{}", job.incident_id, kind.as_str()),
        };
        enqueue(self.queue.as_ref(), &job, JobOptions::default().with_id(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for StatusWorker {
    fn queue(&self) -> QueueName {
        QueueName::StatusCheck
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match job.decode::<StatusCheckJob>()? {
            StatusCheckJob::Sweep { .. } => {
                self.sweep().await?;
            }
            StatusCheckJob::Targeted(target) => {
                self.check_targeted(&target).await?;
            }
        }
        Ok(())
    }
}

/// Recompute 24h, 7d and 30d uptime from check history. No history counts as 100%.
pub fn refresh_uptime(store: &Store, service_id: i64, now: DateTime<Utc>) -> Result<(), crate::db::DbError> {
    let day = store
        .uptime_since(service_id, now - ChronoDuration::hours(24))?
        .unwrap_or(100.0);
    let week = store
        .uptime_since(service_id, now - ChronoDuration::days(7))?
        .unwrap_or(100.0);
    let month = store
        .uptime_since(service_id, now - ChronoDuration::days(30))?
        .unwrap_or(100.0);
    store.update_service_uptime(service_id, day, week, month)
}
