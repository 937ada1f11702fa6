//! Chat webhook notifications.

use crate::db::Severity;
use crate::queue::{AlertKind, IncidentAlertJob};

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

const COLOR_RESOLVED: u32 = 0x22c55e;
const COLOR_CRITICAL: u32 = 0xef4444;
const COLOR_MAJOR: u32 = 0xf97316;
const COLOR_MINOR: u32 = 0xeab308;

/// Webhook error types.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned {0}")]
    Status(u16),
}

/// Embed colour for an alert.
pub fn embed_color(kind: AlertKind, severity: Severity) -> u32 {
    if kind == AlertKind::Resolved {
        return COLOR_RESOLVED;
    }
    match severity {
        Severity::Critical => COLOR_CRITICAL,
        Severity::Major => COLOR_MAJOR,
        Severity::Minor => COLOR_MINOR,
    }
}

/// Posts incident summaries to a Discord-compatible webhook.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    url: Option<String>,
    site_url: String,
}

impl WebhookClient {
    pub fn new(http: reqwest::Client, url: Option<String>, site_url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.filter(|u| !u.trim().is_empty()),
            site_url: site_url.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    fn payload(&self, alert: &IncidentAlertJob, duration: Option<&str>) -> serde_json::Value {
        let (label, status) = match alert.kind {
            AlertKind::Created => ("New Incident", "Investigating"),
            AlertKind::Updated => ("Incident Updated", "Ongoing"),
            AlertKind::Resolved => ("Incident Resolved", "Resolved"),
        };
        let mut fields = vec![
            json!({ "name": "Service", "value": alert.service_name.as_deref().unwrap_or("N/A"), "inline": true }),
            json!({ "name": "Severity", "value": alert.severity.as_str(), "inline": true }),
            json!({ "name": "Status", "value": status, "inline": true }),
        ];
        if let Some(duration) = duration {
            fields.push(json!({ "name": "Duration", "value": duration, "inline": true }));
        }
        json!({
            "embeds": [{
                "title": format!("{}: {}", label, alert.title),
                "description": alert.message,
                "url": format!("{}/status/incidents/{}", self.site_url.trim_end_matches('/'), alert.incident_id),
                "color": embed_color(alert.kind, alert.severity),
                "fields": fields,
                "timestamp": Utc::now().to_rfc3339(),
            }]
        })
    }

    /// Post one alert. Returns false when no webhook is configured.
    pub async fn send(&self, alert: &IncidentAlertJob, duration: Option<&str>) -> Result<bool, WebhookError> {
        let Some(url) = &self.url else {
            return Ok(false);
        };

        let response = self
            .http
            .post(url)
            .json(&self.payload(alert, duration))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(WebhookError::Status(response.status().as_u16()));
        }

        debug!("WebhookClient: posted {} alert for incident {}", alert.kind.as_str(), alert.incident_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert(kind: AlertKind, severity: Severity) -> IncidentAlertJob {
        IncidentAlertJob {
            incident_id: 4,
            kind,
            severity,
            service_name: Some("RPC".to_string()),
            title: "RPC outage".to_string(),
            message: "Automated detection: Request timeout".to_string(),
        }
    }

    #[test]
    fn test_embed_colors() {
        assert_eq!(embed_color(AlertKind::Created, Severity::Critical), 0xef4444);
        assert_eq!(embed_color(AlertKind::Updated, Severity::Major), 0xf97316);
        assert_eq!(embed_color(AlertKind::Created, Severity::Minor), 0xeab308);
        assert_eq!(embed_color(AlertKind::Resolved, Severity::Critical), 0x22c55e);
    }

    #[tokio::test]
    async fn test_posts_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "embeds": [{
                    "title": "New Incident: RPC outage",
                    "url": "https://pyrax.network/status/incidents/4",
                    "color": 0xef4444
                }]
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = WebhookClient::new(reqwest::Client::new(), Some(server.uri()), "https://pyrax.network/");
        let sent = client.send(&alert(AlertKind::Created, Severity::Critical), None).await.unwrap();
        assert!(sent);
    }

    #[test]
    fn test_resolved_payload_has_duration() {
        let client = WebhookClient::new(reqwest::Client::new(), None, "https://pyrax.network");
        let payload = client.payload(&alert(AlertKind::Resolved, Severity::Major), Some("1h 5m"));
        let fields = payload["embeds"][0]["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[2]["value"], "Resolved");
        assert_eq!(fields[3]["value"], "1h 5m");
        assert_eq!(payload["embeds"][0]["color"], 0x22c55e);
    }

    #[tokio::test]
    async fn test_unconfigured_and_failing_webhook() {
        let none = WebhookClient::new(reqwest::Client::new(), None, "https://pyrax.network");
        assert!(!none.send(&alert(AlertKind::Resolved, Severity::Minor), None).await.unwrap());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let failing = WebhookClient::new(reqwest::Client::new(), Some(server.uri()), "https://pyrax.network");
        assert!(matches!(
            failing.send(&alert(AlertKind::Created, Severity::Major), None).await,
            Err(WebhookError::Status(400))
        ));
    }
}
