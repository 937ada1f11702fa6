//! HTTP probe implementation.

use super::{classify, CheckResult, Probe, ProbeOutcome, SLOW_RESPONSE_THRESHOLD, USER_AGENT};

use async_trait::async_trait;
use std::error::Error;
use std::time::{Duration, Instant};

/// Probe that issues a single GET against the service URL.
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    slow_threshold: Duration,
}

impl HttpProbe {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            slow_threshold: SLOW_RESPONSE_THRESHOLD,
        }
    }

    /// Override the degraded-latency threshold.
    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    async fn request(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();

        // The per-request timeout aborts the whole exchange, so one hanging
        // endpoint cannot hold up the rest of the sweep.
        let result = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(timeout)
            .send()
            .await;

        let elapsed = start.elapsed();
        match result {
            Ok(response) => ProbeOutcome::Response {
                status_code: response.status().as_u16(),
                elapsed,
            },
            Err(e) if e.is_timeout() => ProbeOutcome::Timeout { elapsed },
            Err(e) => ProbeOutcome::Failed {
                elapsed,
                message: error_message(&e),
            },
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, url: Option<&str>, timeout: Duration) -> CheckResult {
        match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => classify(self.request(url, timeout).await, self.slow_threshold),
            None => CheckResult::unchecked(),
        }
    }
}

/// Flatten a reqwest error and its sources into one line.
fn error_message(e: &reqwest::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
