//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database connection lock poisoned")]
    Poisoned,
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

const SERVICE_COLUMNS: &str = "id, slug, name, url, timeout_seconds, status, last_checked_at, \
     response_time_ms, last_status_change, uptime_day, uptime_week, uptime_month, is_public";

const INCIDENT_COLUMNS: &str = "id, service_id, title, description, severity, status, \
     impact_start, impact_end, resolved_at, postmortem, created_at, automated";

const SUBSCRIBER_COLUMNS: &str = "id, email, verified, unsubscribe_token, notify_all, \
     notify_major, unsubscribed_at, created_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Services ---

    /// Add a new service and return its ID.
    pub fn add_service(&self, service: &mut Service) -> Result<i64, DbError> {
        if service.timeout_seconds <= 0 {
            service.timeout_seconds = 10;
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO services (slug, name, url, timeout_seconds, status, is_public) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                service.slug,
                service.name,
                service.url,
                service.timeout_seconds,
                service.status.as_str(),
                service.is_public,
            ],
        )?;
        let id = conn.last_insert_rowid();
        service.id = id;
        Ok(id)
    }

    /// Get a service by ID.
    pub fn get_service(&self, id: i64) -> Result<Service, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS),
            params![id],
            service_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All services flagged for public monitoring, in ID order.
    pub fn list_public_services(&self) -> Result<Vec<Service>, DbError> {
        self.query_services("WHERE is_public = 1")
    }

    /// Every service regardless of visibility.
    pub fn list_services(&self) -> Result<Vec<Service>, DbError> {
        self.query_services("")
    }

    fn query_services(&self, filter: &str) -> Result<Vec<Service>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services {} ORDER BY id",
            SERVICE_COLUMNS, filter
        ))?;
        let services = stmt
            .query_map([], service_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(services)
    }

    /// Record a probe that did not change the service status.
    pub fn touch_service(
        &self,
        id: i64,
        checked_at: DateTime<Utc>,
        response_time_ms: Option<i64>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE services SET last_checked_at = ?1, response_time_ms = ?2 WHERE id = ?3",
            params![format_db_time(checked_at), response_time_ms, id],
        )?;
        Ok(())
    }

    /// Persist a status change together with the probe timing.
    pub fn update_service_status(
        &self,
        id: i64,
        status: HealthStatus,
        changed_at: DateTime<Utc>,
        response_time_ms: Option<i64>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        let at = format_db_time(changed_at);
        conn.execute(
            "UPDATE services SET status = ?1, last_status_change = ?2, last_checked_at = ?2, response_time_ms = ?3 WHERE id = ?4",
            params![status.as_str(), at, response_time_ms, id],
        )?;
        Ok(())
    }

    pub fn update_service_uptime(
        &self,
        id: i64,
        day: f64,
        week: f64,
        month: f64,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE services SET uptime_day = ?1, uptime_week = ?2, uptime_month = ?3 WHERE id = ?4",
            params![day, week, month, id],
        )?;
        Ok(())
    }

    // --- Checks ---

    /// Insert a check row and return its ID.
    pub fn add_check(&self, check: &Check) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checks (service_id, status, response_time_ms, status_code, error, source, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                check.service_id,
                check.status.as_str(),
                check.response_time_ms,
                check.status_code,
                check.error,
                check.source,
                format_db_time(check.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent checks for a service, newest first.
    pub fn recent_checks(&self, service_id: i64, limit: i64) -> Result<Vec<Check>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, service_id, status, response_time_ms, status_code, error, source, created_at
             FROM checks WHERE service_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let checks = stmt
            .query_map(params![service_id, limit], |row| {
                Ok(Check {
                    id: row.get(0)?,
                    service_id: row.get(1)?,
                    status: parse_col(row, 2)?,
                    response_time_ms: row.get(3)?,
                    status_code: row.get(4)?,
                    error: row.get(5)?,
                    source: row.get(6)?,
                    created_at: time_col(row, 7)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    pub fn count_checks(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM checks", [], |r| r.get(0))?)
    }

    /// Percentage of operational checks since `since`, or `None` without history.
    pub fn uptime_since(&self, service_id: i64, since: DateTime<Utc>) -> Result<Option<f64>, DbError> {
        let conn = self.conn()?;
        let (total, success): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), SUM(CASE WHEN status = 'OPERATIONAL' THEN 1 ELSE 0 END)
             FROM checks WHERE service_id = ?1 AND created_at >= ?2",
            params![service_id, format_db_time(since)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if total == 0 {
            return Ok(None);
        }
        Ok(Some(success.unwrap_or(0) as f64 / total as f64 * 100.0))
    }

    /// Delete checks created before a cutoff. Returns the number of rows removed.
    pub fn delete_checks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM checks WHERE created_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Metric buckets ---

    /// Fold one check outcome into the hourly bucket containing `at`.
    pub fn record_metric(
        &self,
        service_id: i64,
        at: DateTime<Utc>,
        success: bool,
        response_time_ms: Option<i64>,
    ) -> Result<(), DbError> {
        let hour = truncate_to_hour(at);
        let (ok, failed) = if success { (1, 0) } else { (0, 1) };
        let samples = i64::from(response_time_ms.is_some());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metric_buckets
                (service_id, hour, checks_total, checks_success, checks_failed,
                 response_time_sum, response_samples, avg_response_time, uptime_percent)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(service_id, hour) DO UPDATE SET
                checks_total = checks_total + 1,
                checks_success = checks_success + excluded.checks_success,
                checks_failed = checks_failed + excluded.checks_failed,
                response_time_sum = response_time_sum + excluded.response_time_sum,
                response_samples = response_samples + excluded.response_samples,
                avg_response_time = CASE
                    WHEN response_samples + excluded.response_samples > 0
                    THEN CAST(response_time_sum + excluded.response_time_sum AS REAL)
                         / (response_samples + excluded.response_samples)
                    ELSE NULL END,
                uptime_percent = CAST(checks_success + excluded.checks_success AS REAL) * 100.0
                                 / (checks_total + 1)",
            params![
                service_id,
                format_db_time(hour),
                ok,
                failed,
                response_time_ms.unwrap_or(0),
                samples,
                response_time_ms.map(|v| v as f64),
                if success { 100.0 } else { 0.0 },
            ],
        )?;
        Ok(())
    }

    pub fn get_metric_bucket(
        &self,
        service_id: i64,
        hour: DateTime<Utc>,
    ) -> Result<Option<MetricBucket>, DbError> {
        let conn = self.conn()?;
        let bucket = conn
            .query_row(
                "SELECT service_id, hour, checks_total, checks_success, checks_failed, avg_response_time, uptime_percent
                 FROM metric_buckets WHERE service_id = ?1 AND hour = ?2",
                params![service_id, format_db_time(truncate_to_hour(hour))],
                |row| {
                    Ok(MetricBucket {
                        service_id: row.get(0)?,
                        hour: time_col(row, 1)?,
                        checks_total: row.get(2)?,
                        checks_success: row.get(3)?,
                        checks_failed: row.get(4)?,
                        avg_response_time: row.get(5)?,
                        uptime_percent: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(bucket)
    }

    /// Recount the hourly bucket starting at `hour` from the check rows.
    ///
    /// Returns `false` when the hour has no checks (no bucket is written).
    pub fn reconcile_metric_bucket(&self, service_id: i64, hour: DateTime<Utc>) -> Result<bool, DbError> {
        let start = truncate_to_hour(hour);
        let end = start + ChronoDuration::hours(1);

        let conn = self.conn()?;
        let (total, success, rt_sum, samples): (i64, Option<i64>, Option<i64>, i64) = conn.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN status = 'OPERATIONAL' THEN 1 ELSE 0 END),
                    SUM(response_time_ms),
                    COUNT(response_time_ms)
             FROM checks WHERE service_id = ?1 AND created_at >= ?2 AND created_at < ?3",
            params![service_id, format_db_time(start), format_db_time(end)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        if total == 0 {
            return Ok(false);
        }

        let success = success.unwrap_or(0);
        let rt_sum = rt_sum.unwrap_or(0);
        let avg = if samples > 0 { Some(rt_sum as f64 / samples as f64) } else { None };

        conn.execute(
            "INSERT INTO metric_buckets
                (service_id, hour, checks_total, checks_success, checks_failed,
                 response_time_sum, response_samples, avg_response_time, uptime_percent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(service_id, hour) DO UPDATE SET
                checks_total = excluded.checks_total,
                checks_success = excluded.checks_success,
                checks_failed = excluded.checks_failed,
                response_time_sum = excluded.response_time_sum,
                response_samples = excluded.response_samples,
                avg_response_time = excluded.avg_response_time,
                uptime_percent = excluded.uptime_percent",
            params![
                service_id,
                format_db_time(start),
                total,
                success,
                total - success,
                rt_sum,
                samples,
                avg,
                success as f64 * 100.0 / total as f64,
            ],
        )?;
        Ok(true)
    }

    /// Roll the hourly buckets of the UTC day starting at `day` into `daily_metrics`.
    pub fn roll_up_day(&self, service_id: i64, day: DateTime<Utc>) -> Result<Option<DailyMetric>, DbError> {
        let start = truncate_to_day(day);
        let end = start + ChronoDuration::days(1);

        let conn = self.conn()?;
        let (total, success, failed, rt_sum, samples): (
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        ) = conn.query_row(
            "SELECT SUM(checks_total), SUM(checks_success), SUM(checks_failed),
                    SUM(response_time_sum), SUM(response_samples)
             FROM metric_buckets WHERE service_id = ?1 AND hour >= ?2 AND hour < ?3",
            params![service_id, format_db_time(start), format_db_time(end)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let total = total.unwrap_or(0);
        if total == 0 {
            return Ok(None);
        }

        let samples = samples.unwrap_or(0);
        let metric = DailyMetric {
            service_id,
            day: start,
            checks_total: total,
            checks_success: success.unwrap_or(0),
            checks_failed: failed.unwrap_or(0),
            avg_response_time: if samples > 0 {
                Some(rt_sum.unwrap_or(0) as f64 / samples as f64)
            } else {
                None
            },
            uptime_percent: success.unwrap_or(0) as f64 * 100.0 / total as f64,
        };

        conn.execute(
            "INSERT INTO daily_metrics
                (service_id, day, checks_total, checks_success, checks_failed, avg_response_time, uptime_percent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(service_id, day) DO UPDATE SET
                checks_total = excluded.checks_total,
                checks_success = excluded.checks_success,
                checks_failed = excluded.checks_failed,
                avg_response_time = excluded.avg_response_time,
                uptime_percent = excluded.uptime_percent",
            params![
                metric.service_id,
                format_db_time(metric.day),
                metric.checks_total,
                metric.checks_success,
                metric.checks_failed,
                metric.avg_response_time,
                metric.uptime_percent,
            ],
        )?;

        Ok(Some(metric))
    }

    /// Delete hourly and daily metric rows older than the cutoff.
    pub fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let cutoff = format_db_time(cutoff);
        let hourly = conn.execute("DELETE FROM metric_buckets WHERE hour < ?1", params![cutoff])?;
        let daily = conn.execute("DELETE FROM daily_metrics WHERE day < ?1", params![cutoff])?;
        Ok(hourly + daily)
    }

    pub fn count_metric_buckets(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM metric_buckets", [], |r| r.get(0))?)
    }

    // --- Incidents ---

    /// Open an incident and its first timeline entry in one transaction.
    ///
    /// Returns `None` when the service already has an unresolved incident;
    /// the partial unique index on `incidents(service_id)` makes this safe
    /// against concurrent sweeps.
    pub fn open_incident(&self, new: &NewIncident, message: &str) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = format_db_time(Utc::now());

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO incidents (service_id, title, description, severity, status, impact_start, created_at, automated)
             VALUES (?1, ?2, ?3, ?4, 'INVESTIGATING', ?5, ?6, ?7)",
            params![
                new.service_id,
                new.title,
                new.description,
                new.severity.as_str(),
                format_db_time(new.impact_start),
                now,
                new.automated,
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }

        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO incident_updates (incident_id, status, message, created_at) VALUES (?1, 'INVESTIGATING', ?2, ?3)",
            params![id, message, now],
        )?;
        let incident = tx.query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![id],
            incident_from_row,
        )?;
        tx.commit()?;

        Ok(Some(incident))
    }

    /// The unresolved incident for a service, if any.
    pub fn find_open_incident(&self, service_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incidents WHERE service_id = ?1 AND status != 'RESOLVED' ORDER BY id DESC LIMIT 1",
                    INCIDENT_COLUMNS
                ),
                params![service_id],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    /// The newest incident for a service, resolved or not.
    pub fn find_latest_incident(&self, service_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incidents WHERE service_id = ?1 ORDER BY id DESC LIMIT 1",
                    INCIDENT_COLUMNS
                ),
                params![service_id],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    pub fn get_incident(&self, id: i64) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![id],
            incident_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Most recent incidents, newest first.
    pub fn list_incidents(&self, limit: i64) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents ORDER BY id DESC LIMIT ?1",
            INCIDENT_COLUMNS
        ))?;
        let incidents = stmt
            .query_map(params![limit], incident_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(incidents)
    }

    pub fn count_open_incidents(&self, service_id: i64) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM incidents WHERE service_id = ?1 AND status != 'RESOLVED'",
            params![service_id],
            |r| r.get(0),
        )?)
    }

    /// Mark an unresolved incident resolved and append the recovery entry.
    ///
    /// Returns `false` if the incident was already resolved.
    pub fn resolve_incident(&self, id: i64, at: DateTime<Utc>, message: &str) -> Result<bool, DbError> {
        Ok(self
            .transition_incident(id, IncidentStatus::Resolved, message, None, at)?
            .is_some())
    }

    /// Move an incident to `status` and append a timeline entry.
    ///
    /// This is the single entry point for both automated recovery and operator
    /// updates. Returns `None` when the incident is already resolved.
    pub fn transition_incident(
        &self,
        id: i64,
        status: IncidentStatus,
        message: &str,
        author: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
                params![id],
                incident_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        if !current.status.is_open() {
            return Ok(None);
        }
        if !current.status.can_transition_to(status) {
            return Err(DbError::InvalidTransition(format!(
                "{} -> {}",
                current.status, status
            )));
        }

        let at_str = format_db_time(at);
        if status == IncidentStatus::Resolved {
            tx.execute(
                "UPDATE incidents SET status = 'RESOLVED', resolved_at = ?1, impact_end = ?1 WHERE id = ?2 AND status != 'RESOLVED'",
                params![at_str, id],
            )?;
        } else {
            tx.execute(
                "UPDATE incidents SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        tx.execute(
            "INSERT INTO incident_updates (incident_id, status, message, author, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, status.as_str(), message, author, at_str],
        )?;

        let updated = tx.query_row(
            &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
            params![id],
            incident_from_row,
        )?;
        tx.commit()?;
        Ok(Some(updated))
    }

    /// Raise the severity of an unresolved incident and note it on the timeline.
    pub fn escalate_incident(
        &self,
        id: i64,
        severity: Severity,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let changed = tx.execute(
            "UPDATE incidents SET severity = ?1 WHERE id = ?2 AND status != 'RESOLVED'",
            params![severity.as_str(), id],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        let status: String = tx.query_row(
            "SELECT status FROM incidents WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO incident_updates (incident_id, status, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, status, message, format_db_time(at)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Timeline for an incident, oldest first.
    pub fn incident_updates(&self, incident_id: i64) -> Result<Vec<IncidentUpdate>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, status, message, author, created_at
             FROM incident_updates WHERE incident_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let updates = stmt
            .query_map(params![incident_id], update_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(updates)
    }

    /// Incident with its service name and newest timeline entry.
    pub fn get_incident_detail(&self, id: i64) -> Result<Option<IncidentDetail>, DbError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT i.id, i.service_id, i.title, i.description, i.severity, i.status,
                        i.impact_start, i.impact_end, i.resolved_at, i.postmortem, i.created_at, i.automated, s.name
                 FROM incidents i LEFT JOIN services s ON s.id = i.service_id
                 WHERE i.id = ?1",
                params![id],
                |row| Ok((incident_from_row(row)?, row.get::<_, Option<String>>(12)?)),
            )
            .optional()?;

        let Some((incident, service_name)) = row else {
            return Ok(None);
        };

        let latest_update = conn
            .query_row(
                "SELECT id, incident_id, status, message, author, created_at
                 FROM incident_updates WHERE incident_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![id],
                update_from_row,
            )
            .optional()?;

        Ok(Some(IncidentDetail {
            incident,
            service_name,
            latest_update,
        }))
    }

    // --- Subscribers ---

    pub fn add_subscriber(&self, subscriber: &mut Subscriber) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subscribers (email, verified, unsubscribe_token, notify_all, notify_major, unsubscribed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                subscriber.email,
                subscriber.verified,
                subscriber.unsubscribe_token,
                subscriber.notify_all,
                subscriber.notify_major,
                subscriber.unsubscribed_at.map(format_db_time),
                format_db_time(subscriber.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        subscriber.id = id;
        Ok(id)
    }

    /// Verified, still-subscribed recipients that want an incident of `severity`.
    pub fn list_notifiable_subscribers(&self, severity: Severity) -> Result<Vec<Subscriber>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM subscribers
             WHERE verified = 1 AND unsubscribed_at IS NULL
               AND (notify_all = 1 OR (notify_major = 1 AND ?1 != 'MINOR'))
             ORDER BY id",
            SUBSCRIBER_COLUMNS
        ))?;
        let subscribers = stmt
            .query_map(params![severity.as_str()], subscriber_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(subscribers)
    }

    pub fn count_subscribers(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM subscribers", [], |r| r.get(0))?)
    }

    /// Delete subscribers that never verified and signed up before the cutoff.
    pub fn delete_unverified_subscribers_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM subscribers WHERE verified = 0 AND created_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(n)
    }
}

fn service_from_row(row: &Row<'_>) -> SqlResult<Service> {
    Ok(Service {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        timeout_seconds: row.get(4)?,
        status: parse_col(row, 5)?,
        last_checked_at: opt_time_col(row, 6)?,
        response_time_ms: row.get(7)?,
        last_status_change: opt_time_col(row, 8)?,
        uptime_day: row.get(9)?,
        uptime_week: row.get(10)?,
        uptime_month: row.get(11)?,
        is_public: row.get(12)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        service_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        severity: parse_col(row, 4)?,
        status: parse_col(row, 5)?,
        impact_start: time_col(row, 6)?,
        impact_end: opt_time_col(row, 7)?,
        resolved_at: opt_time_col(row, 8)?,
        postmortem: row.get(9)?,
        created_at: time_col(row, 10)?,
        automated: row.get(11)?,
    })
}

fn update_from_row(row: &Row<'_>) -> SqlResult<IncidentUpdate> {
    Ok(IncidentUpdate {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        status: parse_col(row, 2)?,
        message: row.get(3)?,
        author: row.get(4)?,
        created_at: time_col(row, 5)?,
    })
}

fn subscriber_from_row(row: &Row<'_>) -> SqlResult<Subscriber> {
    Ok(Subscriber {
        id: row.get(0)?,
        email: row.get(1)?,
        verified: row.get(2)?,
        unsubscribe_token: row.get(3)?,
        notify_all: row.get(4)?,
        notify_major: row.get(5)?,
        unsubscribed_at: opt_time_col(row, 6)?,
        created_at: time_col(row, 7)?,
    })
}

fn parse_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> SqlResult<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn time_col(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp: {}", raw).into(),
        )
    })
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| parse_db_time(&s)))
}

/// Format a timestamp the way it is stored (fixed width, sortable).
pub fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

/// Start of the hour containing `dt`.
pub fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_window(dt, 3600)
}

/// Start of the UTC day containing `dt`.
pub fn truncate_to_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_window(dt, 86400)
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}
