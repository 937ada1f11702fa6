//! Configuration loaded from environment variables.
//!
//! Every setting has a default; unset or unparsable variables keep it.

use std::env;
use std::str::FromStr;

/// Queue backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(QueueBackend::Redis),
            "memory" => Ok(QueueBackend::Memory),
            other => Err(format!("unknown queue backend: {}", other)),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port of the operator HTTP API (default: 8080)
    pub http_port: u16,
    /// SQLite database file (default: "status.db")
    pub db_path: String,
    pub queue_backend: QueueBackend,
    pub redis_url: String,
    /// Namespace for every queue key
    pub queue_prefix: String,
    /// Transactional email API key; emails are skipped without one
    pub email_api_key: Option<String>,
    pub email_api_url: String,
    pub email_from: String,
    pub email_from_name: String,
    pub discord_webhook_url: Option<String>,
    /// Base URL used in email and webhook links
    pub site_url: String,
    pub status_concurrency: usize,
    pub incident_concurrency: usize,
    pub email_concurrency: usize,
    /// Allow an open incident to move up to a worse severity
    pub escalate_severity: bool,
    /// Skip a sweep while the previous one is still running
    pub skip_overlapping: bool,
    /// Age in days after which raw checks are deleted
    pub check_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "status.db".to_string(),
            queue_backend: QueueBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_prefix: "pyrax".to_string(),
            email_api_key: None,
            email_api_url: "https://api.brevo.com/v3/smtp/email".to_string(),
            email_from: "status@pyrax.network".to_string(),
            email_from_name: "PYRAX Status".to_string(),
            discord_webhook_url: None,
            site_url: "https://pyrax.network".to_string(),
            status_concurrency: 5,
            incident_concurrency: 5,
            email_concurrency: 10,
            escalate_severity: false,
            skip_overlapping: true,
            check_retention_days: 90,
        }
    }
}

fn parse_into<T: FromStr>(value: Option<String>, target: &mut T) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}

fn parse_positive<T: FromStr + PartialOrd + Default>(value: Option<String>, target: &mut T) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse::<T>().ok()) {
        if parsed > T::default() {
            *target = parsed;
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - `STATUS_HTTP_PORT`, `STATUS_DB_PATH`
    /// - `QUEUE_BACKEND` (`redis` or `memory`), `REDIS_URL`, `QUEUE_PREFIX`
    /// - `EMAIL_API_KEY`, `EMAIL_API_URL`, `EMAIL_FROM`, `EMAIL_FROM_NAME`
    /// - `DISCORD_WEBHOOK_URL`, `SITE_URL`
    /// - `STATUS_WORKER_CONCURRENCY`, `INCIDENT_WORKER_CONCURRENCY`, `EMAIL_WORKER_CONCURRENCY`
    /// - `STATUS_ESCALATE_SEVERITY`, `STATUS_SKIP_OVERLAPPING`, `CHECK_RETENTION_DAYS`
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        parse_into(lookup("STATUS_HTTP_PORT"), &mut cfg.http_port);
        if let Some(path) = non_empty(lookup("STATUS_DB_PATH")) {
            cfg.db_path = path;
        }

        parse_into(lookup("QUEUE_BACKEND"), &mut cfg.queue_backend);
        if let Some(url) = non_empty(lookup("REDIS_URL")) {
            cfg.redis_url = url;
        }
        if let Some(prefix) = non_empty(lookup("QUEUE_PREFIX")) {
            cfg.queue_prefix = prefix;
        }

        cfg.email_api_key = non_empty(lookup("EMAIL_API_KEY"));
        if let Some(url) = non_empty(lookup("EMAIL_API_URL")) {
            cfg.email_api_url = url;
        }
        if let Some(from) = non_empty(lookup("EMAIL_FROM")) {
            cfg.email_from = from;
        }
        if let Some(name) = non_empty(lookup("EMAIL_FROM_NAME")) {
            cfg.email_from_name = name;
        }

        cfg.discord_webhook_url = non_empty(lookup("DISCORD_WEBHOOK_URL"));
        if let Some(url) = non_empty(lookup("SITE_URL")) {
            cfg.site_url = url;
        }

        parse_positive(lookup("STATUS_WORKER_CONCURRENCY"), &mut cfg.status_concurrency);
        parse_positive(lookup("INCIDENT_WORKER_CONCURRENCY"), &mut cfg.incident_concurrency);
        parse_positive(lookup("EMAIL_WORKER_CONCURRENCY"), &mut cfg.email_concurrency);

        parse_into(lookup("STATUS_ESCALATE_SEVERITY"), &mut cfg.escalate_severity);
        parse_into(lookup("STATUS_SKIP_OVERLAPPING"), &mut cfg.skip_overlapping);
        parse_positive(lookup("CHECK_RETENTION_DAYS"), &mut cfg.check_retention_days);

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "status.db");
        assert_eq!(cfg.queue_backend, QueueBackend::Redis);
        assert_eq!(cfg.email_concurrency, 10);
        assert!(cfg.email_api_key.is_none());
        assert!(cfg.skip_overlapping);
        assert!(!cfg.escalate_severity);
    }

    #[test]
    fn test_overrides() {
        let cfg = from_pairs(&[
            ("STATUS_HTTP_PORT", "9090"),
            ("QUEUE_BACKEND", "Memory"),
            ("EMAIL_API_KEY", "xkeysib-123"),
            ("STATUS_WORKER_CONCURRENCY", "2"),
            ("STATUS_ESCALATE_SEVERITY", "true"),
            ("CHECK_RETENTION_DAYS", "30"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.queue_backend, QueueBackend::Memory);
        assert_eq!(cfg.email_api_key.as_deref(), Some("xkeysib-123"));
        assert_eq!(cfg.status_concurrency, 2);
        assert!(cfg.escalate_severity);
        assert_eq!(cfg.check_retention_days, 30);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = from_pairs(&[
            ("STATUS_HTTP_PORT", "not-a-port"),
            ("QUEUE_BACKEND", "kafka"),
            ("EMAIL_API_KEY", "  "),
            ("EMAIL_WORKER_CONCURRENCY", "0"),
            ("STATUS_SKIP_OVERLAPPING", "maybe"),
            ("CHECK_RETENTION_DAYS", "-5"),
        ]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.queue_backend, QueueBackend::Redis);
        assert!(cfg.email_api_key.is_none());
        assert_eq!(cfg.email_concurrency, 10);
        assert!(cfg.skip_overlapping);
        assert_eq!(cfg.check_retention_days, 90);
    }
}
