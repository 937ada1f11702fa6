//! Shared fixtures for worker tests.

use crate::db::{HealthStatus, Service, Store, Subscriber};
use crate::probe::{CheckResult, Probe};
use crate::queue::{
    FailOutcome, Job, JobOptions, JobQueue, MemoryQueue, QueueCounts, QueueError, QueueName,
    RepeatSpec,
};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Probe that replays queued results per URL and reports OPERATIONAL otherwise.
#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<HashMap<String, VecDeque<CheckResult>>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, url: &str, result: CheckResult) {
        self.script
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn ok() -> CheckResult {
        CheckResult {
            status: HealthStatus::Operational,
            response_time_ms: Some(42),
            status_code: Some(200),
            error: None,
        }
    }

    pub fn http(code: u16) -> CheckResult {
        let status = if code >= 500 {
            HealthStatus::MajorOutage
        } else if code >= 400 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Operational
        };
        CheckResult {
            status,
            response_time_ms: Some(42),
            status_code: Some(code),
            error: (code >= 400).then(|| format!("HTTP {}", code)),
        }
    }

    pub fn timeout() -> CheckResult {
        CheckResult {
            status: HealthStatus::MajorOutage,
            response_time_ms: Some(10_000),
            status_code: None,
            error: Some("Request timeout".to_string()),
        }
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn check(&self, url: Option<&str>, _timeout: Duration) -> CheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(url) = url else {
            return CheckResult::unchecked();
        };
        self.script
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(Self::ok)
    }
}

/// In-memory queue whose `add` can be told to fail for one queue.
#[derive(Default)]
pub struct FlakyQueue {
    pub inner: MemoryQueue,
    failures: Mutex<HashMap<QueueName, usize>>,
}

impl FlakyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` adds to `queue` fail.
    pub fn fail_adds(&self, queue: QueueName, times: usize) {
        self.failures.lock().unwrap().insert(queue, times);
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn add(
        &self,
        queue: QueueName,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<bool, QueueError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&queue).filter(|left| **left > 0) {
                *left -= 1;
                return Err(QueueError::Unavailable("connection reset".to_string()));
            }
        }
        self.inner.add(queue, name, data, opts).await
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError> {
        self.inner.claim(queue, lease).await
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        self.inner.complete(job).await
    }

    async fn fail(&self, job: &Job, reason: &str, unrecoverable: bool) -> Result<FailOutcome, QueueError> {
        self.inner.fail(job, reason, unrecoverable).await
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        self.inner.counts(queue).await
    }

    async fn failed(&self, queue: QueueName, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.inner.failed(queue, limit).await
    }

    async fn retry_failed(&self, queue: QueueName, id: &str) -> Result<(), QueueError> {
        self.inner.retry_failed(queue, id).await
    }

    async fn register_repeat(&self, spec: &RepeatSpec) -> Result<(), QueueError> {
        self.inner.register_repeat(spec).await
    }

    async fn repeats(&self) -> Result<Vec<RepeatSpec>, QueueError> {
        self.inner.repeats().await
    }

    async fn unregister_repeat(&self, key: &str) -> Result<(), QueueError> {
        self.inner.unregister_repeat(key).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

pub fn add_service(store: &Store, slug: &str, url: Option<&str>) -> Service {
    let mut service = Service {
        slug: slug.to_string(),
        name: slug.to_uppercase(),
        url: url.map(str::to_string),
        ..Default::default()
    };
    store.add_service(&mut service).unwrap();
    service
}

pub fn add_subscriber(store: &Store, email: &str, notify_all: bool, notify_major: bool) -> Subscriber {
    let mut subscriber = Subscriber {
        id: 0,
        email: email.to_string(),
        verified: true,
        unsubscribe_token: format!("tok-{}", email),
        notify_all,
        notify_major,
        unsubscribed_at: None,
        created_at: Utc::now(),
    };
    store.add_subscriber(&mut subscriber).unwrap();
    subscriber
}
