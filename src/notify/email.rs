//! Transactional email delivery.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Email error types.
#[derive(Error, Debug)]
pub enum EmailError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("template error: {0}")]
    Render(#[from] askama::Error),
}

/// What happened to an outgoing email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No API key configured; the email was only logged.
    Skipped,
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    sender: Address<'a>,
    to: Vec<Address<'a>>,
    subject: &'a str,
    html_content: &'a str,
}

/// Client for a Brevo-style `POST /v3/smtp/email` endpoint.
#[derive(Clone)]
pub struct EmailClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
    from_name: String,
}

impl EmailClient {
    pub fn new(
        http: reqwest::Client,
        api_url: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
        from_name: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            from: from.into(),
            from_name: from_name.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Send one HTML email. A non-2xx answer is an error.
    pub async fn send(&self, to: &str, subject: &str, html: &str) -> Result<Delivery, EmailError> {
        let Some(api_key) = &self.api_key else {
            info!("EmailClient: no API key, would send \"{}\" to {}", subject, to);
            return Ok(Delivery::Skipped);
        };

        let request = SendRequest {
            sender: Address {
                email: &self.from,
                name: Some(&self.from_name),
            },
            to: vec![Address { email: to, name: None }],
            subject,
            html_content: html,
        };

        let response = self
            .http
            .post(&self.api_url)
            .header("api-key", api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        debug!("EmailClient: sent \"{}\" to {}", subject, to);
        Ok(Delivery::Sent)
    }
}
