//! Probe module for service health checks.
//!
//! A probe performs one bounded request against a service URL and turns the
//! outcome into a [`CheckResult`]. Probes never fail: network errors are
//! classified as outages.

mod http;

pub use http::*;

use crate::db::HealthStatus;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Responses slower than this are reported as degraded.
pub const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_millis(5000);

/// User agent sent with every probe.
pub const USER_AGENT: &str = "PYRAX-Status-Monitor/1.0";

/// Classified outcome of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl CheckResult {
    /// Result for a service with nothing to probe.
    pub fn unchecked() -> Self {
        Self {
            status: HealthStatus::Operational,
            response_time_ms: None,
            status_code: None,
            error: None,
        }
    }
}

/// Raw outcome of a request, before classification.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Response { status_code: u16, elapsed: Duration },
    Timeout { elapsed: Duration },
    Failed { elapsed: Duration, message: String },
}

/// Map a raw outcome to a health state.
pub fn classify(outcome: ProbeOutcome, slow_threshold: Duration) -> CheckResult {
    match outcome {
        ProbeOutcome::Response { status_code, elapsed } => {
            let response_time_ms = Some(elapsed.as_millis() as i64);
            let (status, error) = match status_code {
                500..=u16::MAX => (HealthStatus::MajorOutage, Some(format!("HTTP {}", status_code))),
                400..=499 => (HealthStatus::Degraded, Some(format!("HTTP {}", status_code))),
                _ if elapsed > slow_threshold => {
                    (HealthStatus::Degraded, Some("Slow response".to_string()))
                }
                _ => (HealthStatus::Operational, None),
            };
            CheckResult {
                status,
                response_time_ms,
                status_code: Some(status_code),
                error,
            }
        }
        ProbeOutcome::Timeout { elapsed } => CheckResult {
            status: HealthStatus::MajorOutage,
            response_time_ms: Some(elapsed.as_millis() as i64),
            status_code: None,
            error: Some("Request timeout".to_string()),
        },
        ProbeOutcome::Failed { elapsed, message } => CheckResult {
            status: HealthStatus::MajorOutage,
            response_time_ms: Some(elapsed.as_millis() as i64),
            status_code: None,
            error: Some(message),
        },
    }
}

/// Something that can check a service URL.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, url: Option<&str>, timeout: Duration) -> CheckResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(code: u16, ms: u64) -> ProbeOutcome {
        ProbeOutcome::Response {
            status_code: code,
            elapsed: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_classify_status_codes() {
        for code in [200, 204, 299, 301] {
            let r = classify(response(code, 120), SLOW_RESPONSE_THRESHOLD);
            assert_eq!(r.status, HealthStatus::Operational, "code {}", code);
            assert_eq!(r.error, None);
            assert_eq!(r.response_time_ms, Some(120));
        }

        for code in [400, 404, 429, 499] {
            let r = classify(response(code, 10), SLOW_RESPONSE_THRESHOLD);
            assert_eq!(r.status, HealthStatus::Degraded);
            assert_eq!(r.error, Some(format!("HTTP {}", code)));
        }

        for code in [500, 502, 503, 599] {
            let r = classify(response(code, 10), SLOW_RESPONSE_THRESHOLD);
            assert_eq!(r.status, HealthStatus::MajorOutage);
            assert_eq!(r.error, Some(format!("HTTP {}", code)));
            assert_eq!(r.status_code, Some(code));
        }
    }

    #[test]
    fn test_classify_slow_response() {
        let at_threshold = classify(response(200, 5000), SLOW_RESPONSE_THRESHOLD);
        assert_eq!(at_threshold.status, HealthStatus::Operational);

        let slow = classify(response(200, 5001), SLOW_RESPONSE_THRESHOLD);
        assert_eq!(slow.status, HealthStatus::Degraded);
        assert_eq!(slow.error.as_deref(), Some("Slow response"));

        // A slow 503 is still an outage.
        let slow_error = classify(response(503, 9000), SLOW_RESPONSE_THRESHOLD);
        assert_eq!(slow_error.status, HealthStatus::MajorOutage);
    }

    #[test]
    fn test_classify_failures() {
        let timeout = classify(
            ProbeOutcome::Timeout { elapsed: Duration::from_secs(10) },
            SLOW_RESPONSE_THRESHOLD,
        );
        assert_eq!(timeout.status, HealthStatus::MajorOutage);
        assert_eq!(timeout.error.as_deref(), Some("Request timeout"));

        let failed = classify(
            ProbeOutcome::Failed {
                elapsed: Duration::from_millis(3),
                message: "connection refused".to_string(),
            },
            SLOW_RESPONSE_THRESHOLD,
        );
        assert_eq!(failed.status, HealthStatus::MajorOutage);
        assert_eq!(failed.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_unchecked() {
        let r = CheckResult::unchecked();
        assert_eq!(r.status, HealthStatus::Operational);
        assert!(r.response_time_ms.is_none());
        assert!(r.status_code.is_none());
    }
}
