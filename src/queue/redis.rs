//! Redis queue backend.
//!
//! Layout per queue, under `{prefix}:{queue}`:
//!
//! - `:job:{id}` job JSON
//! - `:wait` zset of ready ids, scored by priority then enqueue time
//! - `:delayed` zset of ids scored by the time they become ready
//! - `:active` zset of claimed ids scored by lease deadline
//! - `:failed` list of ids, newest first, capped
//! - `:completed` counter
//!
//! Recurring job registrations live in the `{prefix}:repeat` hash.

use super::{
    now_ms, wait_score, wait_time_digits, FailOutcome, Job, JobOptions, JobQueue, QueueCounts, QueueError,
    QueueName, RepeatSpec, COMPLETED_JOB_TTL, FAILED_JOBS_RETAINED,
};

use ::redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// How long failed job bodies are kept.
const FAILED_JOB_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

const ADD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
if ARGV[3] == '1' then
  redis.call('ZADD', KEYS[3], ARGV[2], ARGV[4])
else
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[4])
end
return 1
"#;

const CLAIM_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local function requeue(id)
  local raw = redis.call('GET', ARGV[3] .. id)
  if raw then
    local job = cjson.decode(raw)
    redis.call('ZADD', KEYS[1], tostring(job.priority) .. ARGV[4], id)
  end
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)) do
  redis.call('ZREM', KEYS[2], id)
  requeue(id)
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)) do
  redis.call('ZREM', KEYS[3], id)
  requeue(id)
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if #head == 0 then
  return false
end
local id = head[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[3], ARGV[2], id)
return redis.call('GET', ARGV[3] .. id)
"#;

/// Key builder for one prefix.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn queue(&self, queue: QueueName, part: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, part)
    }

    fn job_prefix(&self, queue: QueueName) -> String {
        format!("{}:{}:job:", self.prefix, queue)
    }

    fn job(&self, queue: QueueName, id: &str) -> String {
        format!("{}{}", self.job_prefix(queue), id)
    }

    fn repeat(&self) -> String {
        format!("{}:repeat", self.prefix)
    }
}

/// Queue backend on a shared Redis connection.
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: Keys,
    add_script: Script,
    claim_script: Script,
}

impl RedisQueue {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let conn = tokio::time::timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::Unavailable(format!("timed out connecting to {}", url)))??;

        info!("RedisQueue: connected, prefix {}", prefix);
        Ok(Self {
            conn,
            keys: Keys {
                prefix: prefix.to_string(),
            },
            add_script: Script::new(ADD_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
        })
    }

    async fn load_jobs(&self, queue: QueueName, ids: &[String]) -> Result<Vec<Job>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ids.iter().map(|id| self.keys.job(queue, id)).collect();
        let raw: Vec<Option<String>> = ::redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(raw.len());
        for body in raw.into_iter().flatten() {
            match serde_json::from_str::<Job>(&body) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("RedisQueue: skipping unreadable job on {}: {}", queue, e),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn add(
        &self,
        queue: QueueName,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<bool, QueueError> {
        let job = Job::new(queue, name, data, &opts);
        let body = serde_json::to_string(&job)?;
        let now = now_ms();

        let (score, delayed) = match opts.delay.filter(|d| !d.is_zero()) {
            Some(delay) => ((now + delay.as_millis() as i64).to_string(), "1"),
            None => (wait_score(job.priority, now), "0"),
        };

        let mut conn = self.conn.clone();
        let mut invocation = self.add_script.prepare_invoke();
        invocation
            .key(self.keys.job(queue, &job.id))
            .key(self.keys.queue(queue, "wait"))
            .key(self.keys.queue(queue, "delayed"))
            .arg(body)
            .arg(score)
            .arg(delayed)
            .arg(&job.id);
        let added: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(added == 1)
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        let mut invocation = self.claim_script.prepare_invoke();
        invocation
            .key(self.keys.queue(queue, "wait"))
            .key(self.keys.queue(queue, "delayed"))
            .key(self.keys.queue(queue, "active"))
            .arg(now)
            .arg(now + lease.as_millis() as i64)
            .arg(self.keys.job_prefix(queue))
            .arg(wait_time_digits(now));
        let raw: Option<String> = invocation.invoke_async(&mut conn).await?;

        match raw {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let mut done = job.clone();
        done.finished_at = Some(chrono::Utc::now());
        let body = serde_json::to_string(&done)?;

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .zrem(self.keys.queue(job.queue, "active"), &job.id)
            .ignore()
            .set_ex(self.keys.job(job.queue, &job.id), body, COMPLETED_JOB_TTL.as_secs())
            .ignore()
            .incr(self.keys.queue(job.queue, "completed"), 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        job: &Job,
        reason: &str,
        unrecoverable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let mut conn = self.conn.clone();
        let job_key = self.keys.job(job.queue, &job.id);

        // Attempts are tracked on the stored copy.
        let stored: Option<String> = conn.get(&job_key).await?;
        let mut updated = match stored {
            Some(body) => serde_json::from_str::<Job>(&body)?,
            None => job.clone(),
        };
        let outcome = updated.record_failure(reason, unrecoverable);
        let body = serde_json::to_string(&updated)?;

        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .zrem(self.keys.queue(job.queue, "active"), &job.id)
            .ignore();
        match outcome {
            FailOutcome::Retrying { delay } => {
                let ready_at = now_ms() + delay.as_millis() as i64;
                pipe.set(&job_key, body)
                    .ignore()
                    .zadd(self.keys.queue(job.queue, "delayed"), &job.id, ready_at)
                    .ignore();
            }
            FailOutcome::Failed => {
                let failed = self.keys.queue(job.queue, "failed");
                pipe.set_ex(&job_key, body, FAILED_JOB_TTL.as_secs())
                    .ignore()
                    .lpush(&failed, &job.id)
                    .ignore()
                    .ltrim(&failed, 0, FAILED_JOBS_RETAINED as isize - 1)
                    .ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(outcome)
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, failed, completed): (u64, u64, u64, u64, Option<u64>) =
            ::redis::pipe()
                .zcard(self.keys.queue(queue, "wait"))
                .zcard(self.keys.queue(queue, "delayed"))
                .zcard(self.keys.queue(queue, "active"))
                .llen(self.keys.queue(queue, "failed"))
                .get(self.keys.queue(queue, "completed"))
                .query_async(&mut conn)
                .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            failed,
            completed: completed.unwrap_or(0),
        })
    }

    async fn failed(&self, queue: QueueName, limit: usize) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(self.keys.queue(queue, "failed"), 0, limit as isize - 1)
            .await?;
        self.load_jobs(queue, &ids).await
    }

    async fn retry_failed(&self, queue: QueueName, id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(self.keys.queue(queue, "failed"), 1, id).await?;
        if removed == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }

        let job_key = self.keys.job(queue, id);
        let body: Option<String> = conn.get(&job_key).await?;
        let mut job: Job = match body {
            Some(body) => serde_json::from_str(&body)?,
            None => return Err(QueueError::NotFound(id.to_string())),
        };
        job.attempts_made = 0;
        job.failed_reason = None;
        job.finished_at = None;

        // Plain SET also clears the failed-job TTL.
        let _: () = ::redis::pipe()
            .atomic()
            .set(&job_key, serde_json::to_string(&job)?)
            .ignore()
            .zadd(self.keys.queue(queue, "wait"), id, wait_score(job.priority, now_ms()))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn register_repeat(&self, spec: &RepeatSpec) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.keys.repeat(), spec.key(), serde_json::to_string(spec)?)
            .await?;
        Ok(())
    }

    async fn repeats(&self) -> Result<Vec<RepeatSpec>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.keys.repeat()).await?;
        let mut specs = raw
            .iter()
            .map(|body| serde_json::from_str::<RepeatSpec>(body))
            .collect::<Result<Vec<_>, _>>()?;
        specs.sort_by_key(|s| s.key());
        Ok(specs)
    }

    async fn unregister_repeat(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(self.keys.repeat(), key).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        info!("RedisQueue: closing");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_layout() {
        let keys = Keys {
            prefix: "pyrax".to_string(),
        };
        assert_eq!(keys.queue(QueueName::StatusCheck, "wait"), "pyrax:status-check:wait");
        assert_eq!(keys.job(QueueName::Cleanup, "abc"), "pyrax:cleanup:job:abc");
        assert_eq!(keys.job_prefix(QueueName::IncidentAlert), "pyrax:incident-alert:job:");
        assert_eq!(keys.repeat(), "pyrax:repeat");
    }

    /// Needs a Redis at REDIS_URL (default localhost).
    #[tokio::test]
    #[ignore]
    async fn test_redis_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let prefix = format!("pyrax-test-{}", uuid::Uuid::new_v4());
        let q = RedisQueue::connect(&url, &prefix).await.unwrap();

        let opts = JobOptions::default().with_id("job-1");
        assert!(q.add(QueueName::Cleanup, "cleanup-old-checks", json!({ "olderThan": 90 }), opts.clone()).await.unwrap());
        assert!(!q.add(QueueName::Cleanup, "cleanup-old-checks", json!({}), opts).await.unwrap());

        let job = q.claim(QueueName::Cleanup, Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(job.id, "job-1");
        assert_eq!(job.data["olderThan"], 90);

        assert_eq!(q.fail(&job, "nope", true).await.unwrap(), FailOutcome::Failed);
        let failed = q.failed(QueueName::Cleanup, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 1);

        q.retry_failed(QueueName::Cleanup, "job-1").await.unwrap();
        let job = q.claim(QueueName::Cleanup, Duration::from_secs(30)).await.unwrap().unwrap();
        q.complete(&job).await.unwrap();

        let counts = q.counts(QueueName::Cleanup).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.waiting, 0);
    }
}
