//! Application context shared by the workers, scheduler and web server.

use crate::config::{Config, QueueBackend};
use crate::db::{DbError, Store};
use crate::notify::{EmailClient, WebhookClient};
use crate::queue::{JobQueue, MemoryQueue, QueueError, RedisQueue};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Startup error types.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Explicitly constructed handles to the store, the queue backend and the
/// outbound HTTP client.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub store: Arc<Store>,
    pub queue: Arc<dyn JobQueue>,
    pub http: reqwest::Client,
}

impl AppContext {
    /// Open the database and connect to the configured queue backend.
    pub async fn open(config: Config) -> Result<Self, ContextError> {
        let store = Arc::new(Store::new(&config.db_path)?);
        tracing::info!("Database opened at {}", config.db_path);

        let queue: Arc<dyn JobQueue> = match config.queue_backend {
            QueueBackend::Redis => {
                let queue = RedisQueue::connect(&config.redis_url, &config.queue_prefix).await?;
                tracing::info!("Connected to queue backend at {}", config.redis_url);
                Arc::new(queue)
            }
            QueueBackend::Memory => {
                tracing::warn!("Using in-process queue; jobs do not survive a restart");
                Arc::new(MemoryQueue::new())
            }
        };

        Self::with_parts(config, store, queue)
    }

    /// Build a context around an existing store and queue.
    pub fn with_parts(
        config: Config,
        store: Arc<Store>,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self, ContextError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()?;
        Ok(Self {
            config,
            store,
            queue,
            http,
        })
    }

    pub fn email_client(&self) -> EmailClient {
        EmailClient::new(
            self.http.clone(),
            self.config.email_api_url.clone(),
            self.config.email_api_key.clone(),
            self.config.email_from.clone(),
            self.config.email_from_name.clone(),
        )
    }

    pub fn webhook_client(&self) -> WebhookClient {
        WebhookClient::new(
            self.http.clone(),
            self.config.discord_webhook_url.clone(),
            self.config.site_url.clone(),
        )
    }

    /// Release the queue connection.
    pub async fn close(&self) -> Result<(), ContextError> {
        self.queue.close().await?;
        tracing::info!("Queue connection closed");
        Ok(())
    }
}
