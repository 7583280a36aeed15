// crates/jobengine/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::model::{
    Job, JobStatus, JobUpdate, NewJob, QueueStats, WorkerRecord, WorkerStatus,
};
use crate::jobs::store::JobStore;

const JOB_COLUMNS: &str = r#"
    id, queue, job_type, payload, status,
    attempts, max_attempts, priority,
    scheduled_at, started_at, completed_at,
    last_error, created_at
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    job_type: String,
    payload: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            queue: row.queue,
            job_type: row.job_type,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct WorkerRow {
    name: String,
    queue: String,
    status: String,
    last_heartbeat_at: DateTime<Utc>,
}

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    // ----------------------------
    // Enqueue
    // ----------------------------

    async fn create_job(&self, job: NewJob) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (queue, job_type, payload, status, attempts, max_attempts, priority, scheduled_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&job.queue)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(JobStatus::Pending.as_str())
        .bind(job.max_attempts)
        .bind(job.priority)
        .bind(job.scheduled_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    // ----------------------------
    // Claim
    // ----------------------------

    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED inside one transaction.
    /// A concurrent claimer either skips the locked row or, after the winner
    /// commits, no longer sees it as pending.
    async fn claim_next_pending(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            WITH candidate AS (
              SELECT id
              FROM jobs
              WHERE queue = $1
                AND status = 'pending'
                AND scheduled_at <= $2
              ORDER BY priority DESC, scheduled_at ASC, created_at ASC
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'running',
                started_at = $2,
                updated_at = now()
            FROM candidate
            WHERE j.id = candidate.id
              AND j.status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        row.map(Job::try_from).transpose()
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    async fn update_job_status(&self, id: Uuid, update: JobUpdate) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = $3,
                last_error = $4,
                scheduled_at = COALESCE($5, scheduled_at),
                completed_at = COALESCE($6, completed_at),
                started_at = COALESCE($7, started_at),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.attempts)
        .bind(update.last_error.as_deref())
        .bind(update.scheduled_at)
        .bind(update.completed_at)
        .bind(update.started_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("job {id} not found");
        }
        Ok(())
    }

    // ----------------------------
    // Reads
    // ----------------------------

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn count_by_status(&self, queue: &str) -> anyhow::Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM jobs
            WHERE queue = $1
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, n) in rows {
            stats.add(status.parse()?, n);
        }
        Ok(stats)
    }

    async fn find_dead_jobs(&self, queue: &str, limit: i64) -> anyhow::Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE queue = $1
              AND status = 'dead'
            ORDER BY completed_at ASC NULLS FIRST, created_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    // ----------------------------
    // Dead-letter requeue
    // ----------------------------

    /// Same locking shape as the claim: rows another requeue (or anything
    /// else) holds are skipped, and the `status = 'dead'` guard keeps a job
    /// that moved on from being reset.
    async fn requeue_dead_jobs(
        &self,
        queue: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH picked AS (
              SELECT id
              FROM jobs
              WHERE queue = $1
                AND status = 'dead'
              ORDER BY completed_at ASC NULLS FIRST, created_at ASC
              LIMIT $2
              FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'pending',
                attempts = 0,
                last_error = NULL,
                started_at = NULL,
                completed_at = NULL,
                scheduled_at = $3,
                updated_at = now()
            FROM picked
            WHERE j.id = picked.id
              AND j.status = 'dead'
            RETURNING j.id
            "#,
        )
        .bind(queue)
        .bind(limit.max(0))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ids)
    }

    // ----------------------------
    // Retention
    // ----------------------------

    async fn delete_completed_or_dead_older_than(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = $1
              AND status IN ('completed', 'dead')
              AND completed_at IS NOT NULL
              AND completed_at < $2
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }

    // ----------------------------
    // Workers
    // ----------------------------

    async fn upsert_worker(
        &self,
        name: &str,
        queue: &str,
        status: WorkerStatus,
        heartbeat_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_workers (name, queue, status, last_heartbeat_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET queue = EXCLUDED.queue,
                status = EXCLUDED.status,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                updated_at = now()
            "#,
        )
        .bind(name)
        .bind(queue)
        .bind(status.as_str())
        .bind(heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_worker_heartbeat(
        &self,
        name: &str,
        heartbeat_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE job_workers
            SET last_heartbeat_at = $2,
                updated_at = now()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_worker(&self, name: &str) -> anyhow::Result<Option<WorkerRecord>> {
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT name, queue, status, last_heartbeat_at
            FROM job_workers
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> anyhow::Result<WorkerRecord> {
            Ok(WorkerRecord {
                name: r.name,
                queue: r.queue,
                status: r.status.parse()?,
                last_heartbeat_at: r.last_heartbeat_at,
            })
        })
        .transpose()
    }
}
