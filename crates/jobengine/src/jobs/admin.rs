use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::jobs::model::{
    EnqueueOptions, NewJob, QueueStats, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
};
use crate::jobs::store::JobStore;

/// enqueue(queue, job_type, payload, opts) -> job_id
///
/// The payload is serialized into a fresh `serde_json::Value`, so the stored
/// copy shares nothing with the caller's object.
pub async fn enqueue<P>(
    store: &dyn JobStore,
    queue: &str,
    job_type: &str,
    payload: &P,
    opts: EnqueueOptions,
) -> anyhow::Result<Uuid>
where
    P: Serialize + ?Sized,
{
    let payload = serde_json::to_value(payload)?;

    let id = store
        .create_job(NewJob {
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            scheduled_at: opts.scheduled_at.unwrap_or_else(Utc::now),
            priority: opts.priority.unwrap_or(DEFAULT_PRIORITY),
            max_attempts: opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
        })
        .await?;

    info!(job_id = %id, queue, job_type, "job enqueued");
    Ok(id)
}

pub async fn queue_stats(store: &dyn JobStore, queue: &str) -> anyhow::Result<QueueStats> {
    store.count_by_status(queue).await
}

/// Requeue up to `max_count` of the oldest dead jobs with a fresh attempt
/// budget. Returns how many were requeued.
///
/// The dead -> pending reset happens inside the store in one step, so two
/// concurrent calls never requeue the same job twice.
pub async fn retry_dead_jobs(
    store: &dyn JobStore,
    queue: &str,
    max_count: i64,
) -> anyhow::Result<u64> {
    if max_count <= 0 {
        return Ok(0);
    }

    let requeued = store.requeue_dead_jobs(queue, max_count, Utc::now()).await?;
    let retried = requeued.len() as u64;

    if retried > 0 {
        info!(queue, retried, "requeued dead jobs");
    }
    Ok(retried)
}

/// Delete completed/dead jobs finished more than `days_old` days ago.
/// Pending and running jobs are never touched.
pub async fn cleanup_old_jobs(
    store: &dyn JobStore,
    queue: &str,
    days_old: i64,
) -> anyhow::Result<u64> {
    if days_old < 0 {
        anyhow::bail!("days_old must be >= 0, got {days_old}");
    }

    // A cutoff before the representable range has nothing older than it.
    let Some(cutoff) = cutoff_days(days_old) else {
        return Ok(0);
    };

    let deleted = store
        .delete_completed_or_dead_older_than(queue, cutoff)
        .await?;

    if deleted > 0 {
        info!(queue, deleted, days_old, "cleaned up old jobs");
    }
    Ok(deleted)
}

/// "now - N days", or `None` when that falls outside the supported range.
pub fn cutoff_days(days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|d| Utc::now().checked_sub_signed(d))
}
