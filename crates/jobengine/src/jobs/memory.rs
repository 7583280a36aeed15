use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::jobs::model::{
    Job, JobStatus, JobUpdate, NewJob, QueueStats, WorkerRecord, WorkerStatus,
};
use crate::jobs::store::JobStore;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    jobs: HashMap<Uuid, Entry>,
    workers: HashMap<String, WorkerRecord>,
}

/// In-process job store. Every operation runs under a single write or read
/// lock, which is what makes `claim_next_pending` atomic here.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<RwLock<State>>,
}

impl State {
    /// Dead jobs of `queue`, oldest first. `None` sorts first, matching
    /// NULLS FIRST on the SQL side.
    fn oldest_dead(&self, queue: &str, limit: i64) -> Vec<Uuid> {
        let mut dead: Vec<&Entry> = self
            .jobs
            .values()
            .filter(|e| e.job.queue == queue && e.job.status == JobStatus::Dead)
            .collect();
        dead.sort_by_key(|e| (e.job.completed_at, e.job.created_at, e.seq));

        dead.into_iter()
            .take(limit.max(0) as usize)
            .map(|e| e.job.id)
            .collect()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fully-formed record as-is, e.g. when importing jobs or
    /// building fixtures in a specific state.
    pub async fn insert(&self, job: Job) {
        let mut state = self.state.write().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(job.id, Entry { seq, job });
    }

    pub async fn jobs_in(&self, queue: &str) -> Vec<Job> {
        let state = self.state.read().await;
        let mut entries: Vec<&Entry> = state
            .jobs
            .values()
            .filter(|e| e.job.queue == queue)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.job.clone()).collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    #[instrument(skip_all, err, fields(queue = %job.queue, job_type = %job.job_type))]
    async fn create_job(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.insert(Job {
            id,
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            priority: job.priority,
            scheduled_at: job.scheduled_at,
            started_at: None,
            completed_at: None,
            last_error: None,
            created_at: Utc::now(),
        })
        .await;

        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn claim_next_pending(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let mut state = self.state.write().await;

        let candidate = state
            .jobs
            .values_mut()
            .filter(|e| e.job.queue == queue && e.job.is_eligible(now))
            .min_by_key(|e| {
                (
                    Reverse(e.job.priority),
                    e.job.scheduled_at,
                    e.job.created_at,
                    e.seq,
                )
            });

        Ok(candidate.map(|e| {
            e.job.status = JobStatus::Running;
            e.job.started_at = Some(now);
            e.job.clone()
        }))
    }

    #[instrument(skip(self, update), err, fields(status = %update.status))]
    async fn update_job_status(&self, id: Uuid, update: JobUpdate) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let Some(entry) = state.jobs.get_mut(&id) else {
            anyhow::bail!("job {id} not found");
        };

        let job = &mut entry.job;
        job.status = update.status;
        job.attempts = update.attempts;
        job.last_error = update.last_error;
        if let Some(at) = update.scheduled_at {
            job.scheduled_at = at;
        }
        if let Some(at) = update.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(at) = update.started_at {
            job.started_at = Some(at);
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn count_by_status(&self, queue: &str) -> anyhow::Result<QueueStats> {
        let state = self.state.read().await;
        let mut stats = QueueStats::default();
        for e in state.jobs.values().filter(|e| e.job.queue == queue) {
            stats.add(e.job.status, 1);
        }
        Ok(stats)
    }

    async fn find_dead_jobs(&self, queue: &str, limit: i64) -> anyhow::Result<Vec<Job>> {
        let state = self.state.read().await;
        Ok(state
            .oldest_dead(queue, limit)
            .into_iter()
            .filter_map(|id| state.jobs.get(&id).map(|e| e.job.clone()))
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead_jobs(
        &self,
        queue: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>> {
        let mut state = self.state.write().await;
        let ids = state.oldest_dead(queue, limit);

        for id in &ids {
            if let Some(entry) = state.jobs.get_mut(id) {
                let job = &mut entry.job;
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.last_error = None;
                job.started_at = None;
                job.completed_at = None;
                job.scheduled_at = now;
            }
        }
        Ok(ids)
    }

    #[instrument(skip(self), err)]
    async fn delete_completed_or_dead_older_than(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut state = self.state.write().await;
        let before = state.jobs.len();

        state.jobs.retain(|_, e| {
            let expired = e.job.queue == queue
                && e.job.status.is_terminal()
                && e.job.completed_at.is_some_and(|at| at < cutoff);
            !expired
        });

        Ok((before - state.jobs.len()) as u64)
    }

    async fn upsert_worker(
        &self,
        name: &str,
        queue: &str,
        status: WorkerStatus,
        heartbeat_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.workers.insert(
            name.to_string(),
            WorkerRecord {
                name: name.to_string(),
                queue: queue.to_string(),
                status,
                last_heartbeat_at: heartbeat_at,
            },
        );
        Ok(())
    }

    async fn update_worker_heartbeat(
        &self,
        name: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Some(worker) = state.workers.get_mut(name) {
            worker.last_heartbeat_at = heartbeat_at;
        }
        Ok(())
    }

    async fn get_worker(&self, name: &str) -> anyhow::Result<Option<WorkerRecord>> {
        let state = self.state.read().await;
        Ok(state.workers.get(name).cloned())
    }
}
