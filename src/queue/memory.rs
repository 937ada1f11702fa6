//! In-process queue backend used by tests and single-node runs without Redis.

use super::{
    now_ms, FailOutcome, Job, JobOptions, JobQueue, QueueCounts, QueueError, QueueName,
    RepeatSpec, COMPLETED_JOB_TTL, FAILED_JOBS_RETAINED,
};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// (priority, sequence) -> job id. Iteration order is claim order.
    wait: BTreeMap<(u32, u64), String>,
    /// (due ms, sequence) -> job id.
    delayed: BTreeMap<(i64, u64), String>,
    /// job id -> lease deadline ms.
    active: HashMap<String, i64>,
    /// Newest first.
    failed: VecDeque<String>,
    /// job id -> completion ms, for id de-duplication.
    completed: HashMap<String, i64>,
    completed_total: u64,
}

#[derive(Default)]
struct State {
    queues: HashMap<QueueName, QueueState>,
    repeats: BTreeMap<String, RepeatSpec>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

impl QueueState {
    fn push_wait(&mut self, priority: u32, seq: u64, id: String) {
        self.wait.insert((priority, seq), id);
    }

    fn contains(&self, id: &str, now: i64) -> bool {
        if self.jobs.contains_key(id) {
            return true;
        }
        let ttl = COMPLETED_JOB_TTL.as_millis() as i64;
        matches!(self.completed.get(id), Some(done) if now - done < ttl)
    }
}

/// Queue backend that keeps everything in memory behind one lock.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("memory queue lock poisoned".to_string()))
    }

    /// Jobs not yet claimed, in claim order, followed by delayed jobs.
    pub fn pending(&self, queue: QueueName) -> Vec<Job> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        let Some(q) = state.queues.get(&queue) else {
            return Vec::new();
        };
        q.wait
            .values()
            .chain(q.delayed.values())
            .filter_map(|id| q.jobs.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn add(
        &self,
        queue: QueueName,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<bool, QueueError> {
        let job = Job::new(queue, name, data, &opts);
        let now = now_ms();

        let mut state = self.state()?;
        let seq = state.next_seq();
        let q = state.queues.entry(queue).or_default();
        if q.contains(&job.id, now) {
            return Ok(false);
        }

        let id = job.id.clone();
        match opts.delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                q.delayed.insert((now + delay.as_millis() as i64, seq), id.clone());
            }
            None => q.push_wait(job.priority, seq, id.clone()),
        }
        q.jobs.insert(id, job);
        Ok(true)
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>, QueueError> {
        let now = now_ms();
        let mut state = self.state()?;

        // Promote due delayed jobs and recover expired leases.
        let mut ready = Vec::new();
        if let Some(q) = state.queues.get_mut(&queue) {
            let due: Vec<(i64, u64)> = q.delayed.range(..(now + 1, 0)).map(|(k, _)| *k).collect();
            for key in due {
                if let Some(id) = q.delayed.remove(&key) {
                    ready.push(id);
                }
            }
            let stalled: Vec<String> = q
                .active
                .iter()
                .filter(|(_, until)| **until <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stalled {
                q.active.remove(&id);
                warn!("MemoryQueue: lease expired for job {} on {}", id, queue);
                ready.push(id);
            }
        }
        for id in ready {
            let seq = state.next_seq();
            if let Some(q) = state.queues.get_mut(&queue) {
                if let Some(priority) = q.jobs.get(&id).map(|j| j.priority) {
                    q.push_wait(priority, seq, id);
                }
            }
        }

        let Some(q) = state.queues.get_mut(&queue) else {
            return Ok(None);
        };
        let Some((_, id)) = q.wait.pop_first() else {
            return Ok(None);
        };
        q.active.insert(id.clone(), now + lease.as_millis() as i64);
        Ok(q.jobs.get(&id).cloned())
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let now = now_ms();
        let mut state = self.state()?;
        let q = state.queues.entry(job.queue).or_default();
        q.active.remove(&job.id);
        q.jobs.remove(&job.id);
        q.completed.insert(job.id.clone(), now);
        q.completed_total += 1;

        let ttl = COMPLETED_JOB_TTL.as_millis() as i64;
        q.completed.retain(|_, done| now - *done < ttl);
        Ok(())
    }

    async fn fail(
        &self,
        job: &Job,
        reason: &str,
        unrecoverable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let now = now_ms();
        let mut state = self.state()?;
        let seq = state.next_seq();
        let q = state.queues.entry(job.queue).or_default();

        q.active.remove(&job.id);
        let mut stored = q.jobs.remove(&job.id).unwrap_or_else(|| job.clone());
        let outcome = stored.record_failure(reason, unrecoverable);

        match outcome {
            FailOutcome::Retrying { delay } => {
                q.delayed
                    .insert((now + delay.as_millis() as i64, seq), stored.id.clone());
            }
            FailOutcome::Failed => {
                q.failed.push_front(stored.id.clone());
                while q.failed.len() > FAILED_JOBS_RETAINED {
                    if let Some(dropped) = q.failed.pop_back() {
                        q.jobs.remove(&dropped);
                    }
                }
            }
        }
        q.jobs.insert(stored.id.clone(), stored);
        Ok(outcome)
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, QueueError> {
        let state = self.state()?;
        Ok(state
            .queues
            .get(&queue)
            .map(|q| QueueCounts {
                waiting: q.wait.len() as u64,
                delayed: q.delayed.len() as u64,
                active: q.active.len() as u64,
                failed: q.failed.len() as u64,
                completed: q.completed_total,
            })
            .unwrap_or_default())
    }

    async fn failed(&self, queue: QueueName, limit: usize) -> Result<Vec<Job>, QueueError> {
        let state = self.state()?;
        Ok(state
            .queues
            .get(&queue)
            .map(|q| {
                q.failed
                    .iter()
                    .take(limit)
                    .filter_map(|id| q.jobs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn retry_failed(&self, queue: QueueName, id: &str) -> Result<(), QueueError> {
        let mut state = self.state()?;
        let seq = state.next_seq();
        let q = state
            .queues
            .get_mut(&queue)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let pos = q
            .failed
            .iter()
            .position(|f| f == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        q.failed.remove(pos);

        let job = q
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job.attempts_made = 0;
        job.failed_reason = None;
        job.finished_at = None;
        let priority = job.priority;
        q.push_wait(priority, seq, id.to_string());
        Ok(())
    }

    async fn register_repeat(&self, spec: &RepeatSpec) -> Result<(), QueueError> {
        let mut state = self.state()?;
        state.repeats.insert(spec.key(), spec.clone());
        Ok(())
    }

    async fn repeats(&self) -> Result<Vec<RepeatSpec>, QueueError> {
        let state = self.state()?;
        Ok(state.repeats.values().cloned().collect())
    }

    async fn unregister_repeat(&self, key: &str) -> Result<(), QueueError> {
        self.state()?.repeats.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
