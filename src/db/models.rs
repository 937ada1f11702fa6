//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Health of a monitored service as seen by the last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Operational,
    Degraded,
    MajorOutage,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Operational => "OPERATIONAL",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::MajorOutage => "MAJOR_OUTAGE",
        }
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Operational)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPERATIONAL" => Ok(HealthStatus::Operational),
            "DEGRADED" => Ok(HealthStatus::Degraded),
            "MAJOR_OUTAGE" => Ok(HealthStatus::MajorOutage),
            other => Err(format!("unknown health status: {}", other)),
        }
    }
}

/// Incident severity. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MINOR" => Ok(Severity::Minor),
            "MAJOR" => Ok(Severity::Major),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Incident lifecycle state.
///
/// `Identified` and `Monitoring` are only ever set by an operator; the
/// automated path goes `Investigating -> Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "INVESTIGATING",
            IncidentStatus::Identified => "IDENTIFIED",
            IncidentStatus::Monitoring => "MONITORING",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, IncidentStatus::Resolved)
    }

    /// Whether an incident in this state may move to `next`.
    ///
    /// Repeating the current state is allowed so an operator can post a
    /// message-only update. Resolved incidents are final.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        match (self, next) {
            (IncidentStatus::Resolved, _) => false,
            (current, next) if *current == next => true,
            (_, IncidentStatus::Investigating) => false,
            (IncidentStatus::Monitoring, IncidentStatus::Identified) => false,
            _ => true,
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVESTIGATING" => Ok(IncidentStatus::Investigating),
            "IDENTIFIED" => Ok(IncidentStatus::Identified),
            "MONITORING" => Ok(IncidentStatus::Monitoring),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            other => Err(format!("unknown incident status: {}", other)),
        }
    }
}

/// A monitored external endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub url: Option<String>,
    pub timeout_seconds: i64,
    pub status: HealthStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub response_time_ms: Option<i64>,
    pub last_status_change: Option<DateTime<Utc>>,
    pub uptime_day: f64,
    pub uptime_week: f64,
    pub uptime_month: f64,
    pub is_public: bool,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: 0,
            slug: String::new(),
            name: String::new(),
            url: None,
            timeout_seconds: 10,
            status: HealthStatus::Operational,
            last_checked_at: None,
            response_time_ms: None,
            last_status_change: None,
            uptime_day: 100.0,
            uptime_week: 100.0,
            uptime_month: 100.0,
            is_public: true,
        }
    }
}

/// One probe attempt against one service. Never mutated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub id: i64,
    pub service_id: i64,
    pub status: HealthStatus,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Hourly rollup keyed by `(service_id, hour)`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricBucket {
    pub service_id: i64,
    pub hour: DateTime<Utc>,
    pub checks_total: i64,
    pub checks_success: i64,
    pub checks_failed: i64,
    pub avg_response_time: Option<f64>,
    pub uptime_percent: f64,
}

/// Daily rollup of the hourly buckets.
#[derive(Debug, Clone, Serialize)]
pub struct DailyMetric {
    pub service_id: i64,
    pub day: DateTime<Utc>,
    pub checks_total: i64,
    pub checks_success: i64,
    pub checks_failed: i64,
    pub avg_response_time: Option<f64>,
    pub uptime_percent: f64,
}

/// A tracked disruption, optionally tied to a service.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: i64,
    pub service_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub impact_start: DateTime<Utc>,
    pub impact_end: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub postmortem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub automated: bool,
}

/// Fields needed to open a new incident.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub service_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub impact_start: DateTime<Utc>,
    /// Opened by the status sweep rather than an operator.
    pub automated: bool,
}

/// Append-only timeline entry on an incident.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentUpdate {
    pub id: i64,
    pub incident_id: i64,
    pub status: IncidentStatus,
    pub message: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An incident joined with its service name and newest timeline entry.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentDetail {
    pub incident: Incident,
    pub service_name: Option<String>,
    pub latest_update: Option<IncidentUpdate>,
}

/// An email recipient of incident notifications.
#[derive(Debug, Clone, Serialize)]
pub struct Subscriber {
    pub id: i64,
    pub email: String,
    pub verified: bool,
    pub unsubscribe_token: String,
    pub notify_all: bool,
    pub notify_major: bool,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    /// Whether this subscriber wants to hear about an incident of `severity`.
    pub fn wants(&self, severity: Severity) -> bool {
        if !self.verified || self.unsubscribed_at.is_some() {
            return false;
        }
        self.notify_all || (self.notify_major && severity != Severity::Minor)
    }
}
