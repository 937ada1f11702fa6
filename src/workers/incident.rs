//! Incident alert fan-out.

use crate::db::{IncidentDetail, Store, Subscriber};
use crate::notify::{EmailTemplate, IncidentEmail, WebhookClient};
use crate::queue::{
    enqueue, AlertKind, EmailNotificationJob, IncidentAlertJob, Job, JobError, JobHandler,
    JobOptions, JobQueue, QueueName,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Human readable incident length: "45 minutes" or "2h 5m".
pub fn format_duration(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let minutes = (end - start).num_minutes().max(0);
    if minutes < 60 {
        format!("{} minutes", minutes)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

fn resolved_duration(detail: &IncidentDetail) -> Option<String> {
    let incident = &detail.incident;
    incident
        .resolved_at
        .or(incident.impact_end)
        .map(|end| format_duration(incident.impact_start, end))
}

fn format_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Consumer of the incident-alert queue.
pub struct IncidentWorker {
    store: Arc<Store>,
    queue: Arc<dyn JobQueue>,
    webhook: WebhookClient,
    site_url: String,
}

impl IncidentWorker {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<dyn JobQueue>,
        webhook: WebhookClient,
        site_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            webhook,
            site_url: site_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Enqueue one email per interested subscriber and post to the webhook.
    /// Returns the number of emails enqueued.
    pub async fn fan_out(&self, alert: &IncidentAlertJob) -> Result<usize, JobError> {
        let subscribers = self.store.list_notifiable_subscribers(alert.severity)?;
        if subscribers.is_empty() {
            tracing::info!(
                "IncidentWorker: no subscribers for incident {} ({})",
                alert.incident_id,
                alert.kind.as_str()
            );
            return Ok(0);
        }

        let detail = self.store.get_incident_detail(alert.incident_id)?.ok_or_else(|| {
            JobError::Unrecoverable(format!("incident {} not found", alert.incident_id))
        })?;
        let update_id = detail.latest_update.as_ref().map(|u| u.id).unwrap_or(0);

        let mut enqueued = 0;
        for subscriber in &subscribers {
            let job = self.email_for(alert, &detail, subscriber);
            let id = format!(
                "email:{}:{}:{}:{}",
                alert.incident_id,
                alert.kind.as_str(),
                subscriber.id,
                update_id
            );
            if enqueue(self.queue.as_ref(), &job, JobOptions::default().with_id(id)).await? {
                enqueued += 1;
            }
        }
        tracing::info!(
            "IncidentWorker: queued {} emails for incident {} ({})",
            enqueued,
            alert.incident_id,
            alert.kind.as_str()
        );

        // Best effort: a webhook failure never fails the job.
        let duration = resolved_duration(&detail);
        if let Err(e) = self.webhook.send(alert, duration.as_deref()).await {
            tracing::warn!(
                "IncidentWorker: webhook for incident {} failed: {}",
                alert.incident_id,
                e
            );
        }

        Ok(enqueued)
    }

    fn email_for(
        &self,
        alert: &IncidentAlertJob,
        detail: &IncidentDetail,
        subscriber: &Subscriber,
    ) -> EmailNotificationJob {
        let incident = &detail.incident;
        let resolved_at = incident.resolved_at.or(incident.impact_end);

        let data = IncidentEmail {
            incident_id: incident.id,
            title: incident.title.clone(),
            description: incident.description.clone(),
            service_name: detail.service_name.clone().or_else(|| alert.service_name.clone()),
            severity: incident.severity,
            status: incident.status.to_string(),
            message: detail
                .latest_update
                .as_ref()
                .map(|u| u.message.clone())
                .unwrap_or_else(|| alert.message.clone()),
            started_at: format_time(incident.impact_start),
            resolved_at: resolved_at.map(format_time),
            duration: resolved_duration(detail),
            unsubscribe_url: format!(
                "{}/status/unsubscribe?token={}",
                self.site_url, subscriber.unsubscribe_token
            ),
        };

        let (subject, template) = match alert.kind {
            AlertKind::Created => (
                format!("[{}] {}", incident.severity, incident.title),
                EmailTemplate::IncidentCreated(data),
            ),
            AlertKind::Updated => (
                format!("[Update] {}", incident.title),
                EmailTemplate::IncidentUpdated(data),
            ),
            AlertKind::Resolved => (
                format!("[Resolved] {}", incident.title),
                EmailTemplate::IncidentResolved(data),
            ),
        };

        EmailNotificationJob {
            to: subscriber.email.clone(),
            subject,
            template,
        }
    }
}

#[async_trait]
impl JobHandler for IncidentWorker {
    fn queue(&self) -> QueueName {
        QueueName::IncidentAlert
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let alert: IncidentAlertJob = job.decode()?;
        self.fan_out(&alert).await?;
        Ok(())
    }
}
