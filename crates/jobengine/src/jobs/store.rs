use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::jobs::model::{Job, JobUpdate, NewJob, QueueStats, WorkerRecord, WorkerStatus};

/// Durable home of job and worker records.
///
/// `claim_next_pending` is the one operation with a hard concurrency
/// contract: for a given job id, the pending -> running transition must be
/// observed by at most one caller, across threads and processes.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<Uuid>;

    /// Claim the best eligible job in `queue`: `pending`, `scheduled_at <= now`,
    /// ordered by priority desc, scheduled_at asc, created_at asc.
    /// Sets `status = running` and `started_at = now`.
    async fn claim_next_pending(&self, queue: &str, now: DateTime<Utc>)
        -> anyhow::Result<Option<Job>>;

    async fn update_job_status(&self, id: Uuid, update: JobUpdate) -> anyhow::Result<()>;

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<Job>>;

    async fn count_by_status(&self, queue: &str) -> anyhow::Result<QueueStats>;

    /// Oldest dead jobs first (completed_at, then created_at).
    async fn find_dead_jobs(&self, queue: &str, limit: i64) -> anyhow::Result<Vec<Job>>;

    /// Atomically move up to `limit` of the oldest dead jobs (same order as
    /// `find_dead_jobs`) back to `pending`: attempts 0, `last_error`,
    /// `started_at` and `completed_at` cleared, `scheduled_at = now`.
    /// Only jobs still `dead` at write time are touched. Returns their ids.
    async fn requeue_dead_jobs(
        &self,
        queue: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>>;

    async fn delete_completed_or_dead_older_than(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    async fn upsert_worker(
        &self,
        name: &str,
        queue: &str,
        status: WorkerStatus,
        heartbeat_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn update_worker_heartbeat(
        &self,
        name: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn get_worker(&self, name: &str) -> anyhow::Result<Option<WorkerRecord>>;
}
