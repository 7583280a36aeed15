#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use jobengine::jobs::{Job, JobStatus, JobStore};
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration as StdDuration;
use uuid::Uuid;

/// Connects to TEST_DATABASE_URL, migrates and truncates.
/// Returns `None` when no test database is configured so the caller can skip.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs, job_workers")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

/// A job record in an arbitrary state, for seeding `MemoryJobStore`.
pub fn job_fixture(queue: &str, status: JobStatus) -> Job {
    let now = Utc::now();
    Job {
        id: Uuid::new_v4(),
        queue: queue.to_string(),
        job_type: "test_job".to_string(),
        payload: json!({}),
        status,
        attempts: 0,
        max_attempts: 5,
        priority: 0,
        scheduled_at: now,
        started_at: None,
        completed_at: None,
        last_error: None,
        created_at: now,
    }
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

/// Polls the store until the job reaches `status`, panicking after `timeout`.
pub async fn wait_for_status(
    store: &dyn JobStore,
    id: Uuid,
    status: JobStatus,
    timeout: StdDuration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get_job(id).await.unwrap().expect("job vanished");
        if job.status == status {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {id} stuck in {} waiting for {status}", job.status);
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
}
