//! Email templates.
//!
//! Each kind of email is one variant carrying the data it needs. The HTML
//! lives in `templates/email/` and is compiled in by askama.

use crate::db::Severity;

use askama::Template;
use serde::{Deserialize, Serialize};

/// Data for the three incident emails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentEmail {
    pub incident_id: i64,
    pub title: String,
    pub description: String,
    pub service_name: Option<String>,
    pub severity: Severity,
    pub status: String,
    pub message: String,
    pub started_at: String,
    pub resolved_at: Option<String>,
    pub duration: Option<String>,
    pub unsubscribe_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEmail {
    pub verify_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeEmail {
    pub status_url: String,
    pub unsubscribe_url: String,
}

/// The closed set of emails the pipeline can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "template", content = "data", rename_all = "snake_case")]
pub enum EmailTemplate {
    IncidentCreated(IncidentEmail),
    IncidentUpdated(IncidentEmail),
    IncidentResolved(IncidentEmail),
    SubscriptionVerify(VerifyEmail),
    SubscriptionWelcome(WelcomeEmail),
}

impl EmailTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            EmailTemplate::IncidentCreated(_) => "incident_created",
            EmailTemplate::IncidentUpdated(_) => "incident_updated",
            EmailTemplate::IncidentResolved(_) => "incident_resolved",
            EmailTemplate::SubscriptionVerify(_) => "subscription_verify",
            EmailTemplate::SubscriptionWelcome(_) => "subscription_welcome",
        }
    }

    /// Render the HTML body.
    pub fn render(&self) -> Result<String, askama::Error> {
        match self {
            EmailTemplate::IncidentCreated(e) => IncidentHtml::new(e, "New incident").render(),
            EmailTemplate::IncidentUpdated(e) => IncidentHtml::new(e, "Incident update").render(),
            EmailTemplate::IncidentResolved(e) => IncidentResolvedHtml {
                inner: IncidentHtml::new(e, "Incident resolved"),
                resolved_at: e.resolved_at.as_deref().unwrap_or(""),
                duration: e.duration.as_deref().unwrap_or(""),
            }
            .render(),
            EmailTemplate::SubscriptionVerify(v) => VerifyHtml {
                verify_url: &v.verify_url,
            }
            .render(),
            EmailTemplate::SubscriptionWelcome(w) => WelcomeHtml {
                status_url: &w.status_url,
                unsubscribe_url: &w.unsubscribe_url,
            }
            .render(),
        }
    }
}

#[derive(Template)]
#[template(path = "email/incident.html")]
struct IncidentHtml<'a> {
    heading: &'a str,
    title: &'a str,
    description: &'a str,
    service_name: &'a str,
    severity: &'a str,
    status: &'a str,
    message: &'a str,
    started_at: &'a str,
    unsubscribe_url: &'a str,
}

impl<'a> IncidentHtml<'a> {
    fn new(e: &'a IncidentEmail, heading: &'a str) -> Self {
        Self {
            heading,
            title: &e.title,
            description: &e.description,
            service_name: e.service_name.as_deref().unwrap_or(""),
            severity: e.severity.as_str(),
            status: &e.status,
            message: &e.message,
            started_at: &e.started_at,
            unsubscribe_url: &e.unsubscribe_url,
        }
    }
}

#[derive(Template)]
#[template(path = "email/incident_resolved.html")]
struct IncidentResolvedHtml<'a> {
    inner: IncidentHtml<'a>,
    resolved_at: &'a str,
    duration: &'a str,
}

#[derive(Template)]
#[template(path = "email/subscription_verify.html")]
struct VerifyHtml<'a> {
    verify_url: &'a str,
}

#[derive(Template)]
#[template(path = "email/subscription_welcome.html")]
struct WelcomeHtml<'a> {
    status_url: &'a str,
    unsubscribe_url: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident() -> IncidentEmail {
        IncidentEmail {
            incident_id: 9,
            title: "API <outage>".to_string(),
            description: "Requests failing".to_string(),
            service_name: Some("API".to_string()),
            severity: Severity::Critical,
            status: "RESOLVED".to_string(),
            message: "Service has recovered".to_string(),
            started_at: "2024-05-01 10:00 UTC".to_string(),
            resolved_at: Some("2024-05-01 11:30 UTC".to_string()),
            duration: Some("1h 30m".to_string()),
            unsubscribe_url: "https://pyrax.network/status/unsubscribe?token=abc".to_string(),
        }
    }

    #[test]
    fn test_incident_email_renders_escaped_fields() {
        let html = EmailTemplate::IncidentCreated(incident()).render().unwrap();
        assert!(html.contains("New incident"));
        assert!(html.contains("API &lt;outage&gt;"));
        assert!(html.contains("CRITICAL"));
        assert!(html.contains("token=abc"));
    }

    #[test]
    fn test_resolved_email_includes_duration() {
        let html = EmailTemplate::IncidentResolved(incident()).render().unwrap();
        assert!(html.contains("Incident resolved"));
        assert!(html.contains("1h 30m"));
        assert!(html.contains("2024-05-01 11:30 UTC"));
    }

    #[test]
    fn test_subscription_emails() {
        let verify = EmailTemplate::SubscriptionVerify(VerifyEmail {
            verify_url: "https://pyrax.network/status/verify?token=v".to_string(),
        });
        assert_eq!(verify.name(), "subscription_verify");
        assert!(verify.render().unwrap().contains("verify?token=v"));

        let welcome = EmailTemplate::SubscriptionWelcome(WelcomeEmail {
            status_url: "https://pyrax.network/status".to_string(),
            unsubscribe_url: "https://pyrax.network/status/unsubscribe?token=u".to_string(),
        });
        assert!(welcome.render().unwrap().contains("unsubscribe?token=u"));
    }

    #[test]
    fn test_template_tagging() {
        let value = serde_json::to_value(EmailTemplate::IncidentUpdated(incident())).unwrap();
        assert_eq!(value["template"], "incident_updated");
        assert_eq!(value["data"]["incidentId"], 9);
        assert_eq!(value["data"]["severity"], "CRITICAL");
    }
}
