//! Job payload contracts exchanged between the queues.

use super::{JobOptions, JobQueue, QueueError, QueueName};
use crate::db::Severity;
use crate::notify::EmailTemplate;

use serde::{Deserialize, Serialize};

/// A typed payload that belongs to exactly one queue.
pub trait JobPayload: Serialize {
    const QUEUE: QueueName;

    fn job_name(&self) -> &'static str;
}

/// Serialize `payload` and put it on its queue.
pub async fn enqueue<P>(queue: &dyn JobQueue, payload: &P, opts: JobOptions) -> Result<bool, QueueError>
where
    P: JobPayload + Sync,
{
    let data = serde_json::to_value(payload)?;
    queue.add(P::QUEUE, payload.job_name(), data, opts).await
}

// --- status-check ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepTrigger {
    Cron,
    Manual,
}

/// Probe one service outside the regular sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetedCheck {
    pub service_id: i64,
    pub service_slug: String,
    pub service_name: String,
    pub url: Option<String>,
    /// Seconds.
    pub timeout: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusCheckJob {
    Targeted(TargetedCheck),
    Sweep { trigger: SweepTrigger },
}

impl StatusCheckJob {
    pub fn cron() -> Self {
        StatusCheckJob::Sweep {
            trigger: SweepTrigger::Cron,
        }
    }
}

impl JobPayload for StatusCheckJob {
    const QUEUE: QueueName = QueueName::StatusCheck;

    fn job_name(&self) -> &'static str {
        match self {
            StatusCheckJob::Targeted(_) => "check-service",
            StatusCheckJob::Sweep { .. } => "check-all",
        }
    }
}

// --- email-notification ---

/// One email to one recipient.
///
/// On the wire the template is `{"template": "<name>", "data": {...}}` next
/// to `to` and `subject`; an unknown template name fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEmailJob", into = "WireEmailJob")]
pub struct EmailNotificationJob {
    pub to: String,
    pub subject: String,
    pub template: EmailTemplate,
}

#[derive(Serialize, Deserialize)]
struct WireEmailJob {
    to: String,
    subject: String,
    template: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl TryFrom<WireEmailJob> for EmailNotificationJob {
    type Error = serde_json::Error;

    fn try_from(wire: WireEmailJob) -> Result<Self, Self::Error> {
        let template = serde_json::from_value(serde_json::json!({
            "template": wire.template,
            "data": wire.data,
        }))?;
        Ok(Self {
            to: wire.to,
            subject: wire.subject,
            template,
        })
    }
}

impl From<EmailNotificationJob> for WireEmailJob {
    fn from(job: EmailNotificationJob) -> Self {
        let (template, data) = match serde_json::to_value(&job.template) {
            Ok(serde_json::Value::Object(mut map)) => (
                map.remove("template")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                map.remove("data").unwrap_or_default(),
            ),
            _ => (job.template.name().to_string(), serde_json::Value::Null),
        };
        Self {
            to: job.to,
            subject: job.subject,
            template,
            data,
        }
    }
}

impl JobPayload for EmailNotificationJob {
    const QUEUE: QueueName = QueueName::EmailNotification;

    fn job_name(&self) -> &'static str {
        self.template.name()
    }
}

// --- incident-alert ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Created,
    Updated,
    Resolved,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Created => "created",
            AlertKind::Updated => "updated",
            AlertKind::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentAlertJob {
    pub incident_id: i64,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: Severity,
    pub service_name: Option<String>,
    pub title: String,
    pub message: String,
}

impl JobPayload for IncidentAlertJob {
    const QUEUE: QueueName = QueueName::IncidentAlert;

    fn job_name(&self) -> &'static str {
        match self.kind {
            AlertKind::Created => "incident-created",
            AlertKind::Updated => "incident-updated",
            AlertKind::Resolved => "incident-resolved",
        }
    }
}

// --- metrics-aggregation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAggregationJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<i64>,
    pub period: MetricsPeriod,
}

impl JobPayload for MetricsAggregationJob {
    const QUEUE: QueueName = QueueName::MetricsAggregation;

    fn job_name(&self) -> &'static str {
        match self.period {
            MetricsPeriod::Hourly => "aggregate-hourly",
            MetricsPeriod::Daily => "aggregate-daily",
            MetricsPeriod::Weekly => "aggregate-weekly",
            MetricsPeriod::Monthly => "aggregate-monthly",
        }
    }
}

// --- cleanup ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupKind {
    OldChecks,
    OldMetrics,
    ExpiredTokens,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupJob {
    #[serde(rename = "type")]
    pub kind: CleanupKind,
    /// Days.
    pub older_than: i64,
}

impl JobPayload for CleanupJob {
    const QUEUE: QueueName = QueueName::Cleanup;

    fn job_name(&self) -> &'static str {
        match self.kind {
            CleanupKind::OldChecks => "cleanup-old-checks",
            CleanupKind::OldMetrics => "cleanup-old-metrics",
            CleanupKind::ExpiredTokens => "cleanup-expired-tokens",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::IncidentEmail;
    use serde_json::json;

    #[test]
    fn test_status_check_job_shapes() {
        let sweep: StatusCheckJob = serde_json::from_value(json!({ "trigger": "cron" })).unwrap();
        assert_eq!(sweep, StatusCheckJob::cron());

        let targeted: StatusCheckJob = serde_json::from_value(json!({
            "serviceId": 7,
            "serviceSlug": "rpc",
            "serviceName": "RPC",
            "url": "https://rpc.example.com",
            "timeout": 10
        }))
        .unwrap();
        match targeted {
            StatusCheckJob::Targeted(t) => {
                assert_eq!(t.service_id, 7);
                assert_eq!(t.timeout, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_incident_alert_wire_format() {
        let job = IncidentAlertJob {
            incident_id: 3,
            kind: AlertKind::Resolved,
            severity: Severity::Critical,
            service_name: Some("API".to_string()),
            title: "API outage".to_string(),
            message: "recovered".to_string(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "resolved");
        assert_eq!(value["incidentId"], 3);
        assert_eq!(value["severity"], "CRITICAL");
        assert_eq!(job.job_name(), "incident-resolved");
    }

    #[test]
    fn test_email_job_wire_format() {
        let job = EmailNotificationJob {
            to: "a@example.com".to_string(),
            subject: "Incident".to_string(),
            template: EmailTemplate::IncidentCreated(IncidentEmail {
                incident_id: 1,
                title: "API outage".to_string(),
                description: "down".to_string(),
                service_name: Some("API".to_string()),
                severity: Severity::Major,
                status: "INVESTIGATING".to_string(),
                message: "Automated detection: HTTP 503".to_string(),
                started_at: "2024-05-01 10:00 UTC".to_string(),
                resolved_at: None,
                duration: None,
                unsubscribe_url: "https://pyrax.network/status/unsubscribe?token=t".to_string(),
            }),
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["to"], "a@example.com");
        assert_eq!(value["template"], "incident_created");
        assert_eq!(value["data"]["title"], "API outage");

        let back: EmailNotificationJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_unknown_email_template_is_rejected() {
        let result: Result<EmailNotificationJob, _> = serde_json::from_value(json!({
            "to": "a@example.com",
            "subject": "hi",
            "template": "password_reset",
            "data": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_cleanup_and_metrics_shapes() {
        let cleanup: CleanupJob =
            serde_json::from_value(json!({ "type": "old_checks", "olderThan": 90 })).unwrap();
        assert_eq!(cleanup.kind, CleanupKind::OldChecks);
        assert_eq!(cleanup.older_than, 90);

        let metrics: MetricsAggregationJob =
            serde_json::from_value(json!({ "period": "daily" })).unwrap();
        assert_eq!(metrics.service_id, None);
        assert_eq!(metrics.period, MetricsPeriod::Daily);
    }
}
