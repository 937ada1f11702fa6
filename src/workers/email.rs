//! Email delivery worker.

use crate::notify::{Delivery, EmailClient, EmailError};
use crate::queue::{EmailNotificationJob, Job, JobError, JobHandler, QueueName};

use async_trait::async_trait;

/// Consumer of the email-notification queue.
pub struct EmailWorker {
    client: EmailClient,
}

impl EmailWorker {
    pub fn new(client: EmailClient) -> Self {
        if !client.is_configured() {
            tracing::warn!("EmailWorker: no email API key configured, emails will only be logged");
        }
        Self { client }
    }

    pub async fn deliver(&self, email: &EmailNotificationJob) -> Result<Delivery, JobError> {
        let html = email.template.render().map_err(|e| {
            JobError::Unrecoverable(format!("failed to render {}: {}", email.template.name(), e))
        })?;

        match self.client.send(&email.to, &email.subject, &html).await {
            Ok(delivery) => Ok(delivery),
            Err(e @ EmailError::Render(_)) => Err(JobError::Unrecoverable(e.to_string())),
            Err(e) => Err(JobError::Retryable(e.to_string())),
        }
    }
}

#[async_trait]
impl JobHandler for EmailWorker {
    fn queue(&self) -> QueueName {
        QueueName::EmailNotification
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let email: EmailNotificationJob = job.decode()?;
        let delivery = self.deliver(&email).await?;
        tracing::debug!(
            "EmailWorker: {} {} to {} ({:?})",
            job.id,
            email.template.name(),
            email.to,
            delivery
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::VerifyEmail;
    use crate::queue::{
        drain, enqueue, Backoff, JobOptions, JobQueue, MemoryQueue,
    };
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn verify_job() -> EmailNotificationJob {
        EmailNotificationJob {
            to: "new@example.com".to_string(),
            subject: "Confirm your subscription".to_string(),
            template: crate::notify::EmailTemplate::SubscriptionVerify(VerifyEmail {
                verify_url: "https://pyrax.network/status/verify?token=v".to_string(),
            }),
        }
    }

    fn client(url: String, key: Option<&str>) -> EmailClient {
        EmailClient::new(
            reqwest::Client::new(),
            url,
            key.map(str::to_string),
            "status@pyrax.network",
            "PYRAX Status",
        )
    }

    fn fast_retries() -> JobOptions {
        JobOptions {
            backoff: Backoff::Fixed { delay_ms: 0 },
            ..JobOptions::default()
        }
    }

    #[tokio::test]
    async fn test_delivers_rendered_email() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("api-key", "k"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let queue = MemoryQueue::new();
        enqueue(&queue, &verify_job(), JobOptions::default()).await.unwrap();

        let worker = EmailWorker::new(client(server.uri(), Some("k")));
        assert_eq!(drain(&queue, &worker).await.unwrap(), 1);
        assert_eq!(queue.counts(QueueName::EmailNotification).await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_provider_error_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let queue = MemoryQueue::new();
        enqueue(&queue, &verify_job(), fast_retries()).await.unwrap();

        let worker = EmailWorker::new(client(server.uri(), Some("k")));
        drain(&queue, &worker).await.unwrap();

        let failed = queue.failed(QueueName::EmailNotification, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 3);
        assert!(failed[0].failed_reason.as_deref().unwrap_or("").contains("502"));
    }

    #[tokio::test]
    async fn test_unknown_template_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let queue = MemoryQueue::new();
        queue
            .add(
                QueueName::EmailNotification,
                "password_reset",
                json!({ "to": "a@example.com", "subject": "x", "template": "password_reset", "data": {} }),
                JobOptions::default(),
            )
            .await
            .unwrap();

        let worker = EmailWorker::new(client(server.uri(), Some("k")));
        assert_eq!(drain(&queue, &worker).await.unwrap(), 1);

        let failed = queue.failed(QueueName::EmailNotification, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 1);
    }

    #[tokio::test]
    async fn test_without_api_key_is_a_noop() {
        let worker = EmailWorker::new(client("http://127.0.0.1:9/v3/smtp/email".to_string(), None));
        let delivery = worker.deliver(&verify_job()).await.unwrap();
        assert_eq!(delivery, Delivery::Skipped);
    }
}
