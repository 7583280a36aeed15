use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::jobs::{
    model::{Job, JobStatus, JobUpdate},
    registry::{HandlerRegistry, JobContext, JobError},
    retry::{next_scheduled_at, RetryConfig},
    store::JobStore,
};

/// What `run_job` wrote back for a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retrying { attempts: i32 },
    Dead { attempts: i32, reason: DeadReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    MissingHandler,
    MaxAttemptsExceeded,
}

/// Executes one claimed job and records its outcome.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    retry_cfg: RetryConfig,
    default_timeout: Option<Duration>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        retry_cfg: RetryConfig,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            registry,
            retry_cfg,
            default_timeout,
        }
    }

    /// Handler errors never escape: they become the job's next state.
    /// The returned `Err` is only for failures to persist that state.
    pub async fn run_job(&self, job: Job) -> anyhow::Result<JobOutcome> {
        // attempts <= max_attempts holds after every write
        let attempts = (job.attempts + 1).min(job.max_attempts.max(1));

        let Some(entry) = self.registry.handler_for(&job.job_type) else {
            return self.on_missing_handler(&job, attempts).await;
        };

        let ctx = JobContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempts,
            max_attempts: job.max_attempts,
        };

        debug!(job_id = %job.id, job_type = %job.job_type, attempts, "running job");

        let start = Instant::now();
        let result = entry.run(ctx, self.default_timeout).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                self.on_success(&job, attempts).await?;
                info!(job_id = %job.id, job_type = %job.job_type, attempts, latency_ms, "job completed");
                Ok(JobOutcome::Completed)
            }
            Err(err) => self.on_failure(&job, attempts, &err, latency_ms).await,
        }
    }

    async fn on_success(&self, job: &Job, attempts: i32) -> anyhow::Result<()> {
        self.store
            .update_job_status(
                job.id,
                JobUpdate::new(JobStatus::Completed, attempts).completed_at(Utc::now()),
            )
            .await
    }

    async fn on_failure(
        &self,
        job: &Job,
        attempts: i32,
        err: &JobError,
        latency_ms: u64,
    ) -> anyhow::Result<JobOutcome> {
        let now = Utc::now();

        if attempts >= job.max_attempts {
            self.store
                .update_job_status(
                    job.id,
                    JobUpdate::new(JobStatus::Dead, attempts)
                        .last_error(err.to_string())
                        .completed_at(now),
                )
                .await?;

            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts,
                max_attempts = job.max_attempts,
                latency_ms,
                error = %err,
                "job max attempts reached, moved to dead"
            );
            return Ok(JobOutcome::Dead {
                attempts,
                reason: DeadReason::MaxAttemptsExceeded,
            });
        }

        let next_run = next_scheduled_at(now, attempts, &self.retry_cfg);
        self.store
            .update_job_status(
                job.id,
                JobUpdate::new(JobStatus::Pending, attempts)
                    .last_error(err.to_string())
                    .scheduled_at(next_run),
            )
            .await?;

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts,
            max_attempts = job.max_attempts,
            latency_ms,
            error = %err,
            retry_at = %next_run,
            "job failed, rescheduled"
        );
        Ok(JobOutcome::Retrying { attempts })
    }

    /// Configuration error, not a transient fault: dead right away.
    async fn on_missing_handler(&self, job: &Job, attempts: i32) -> anyhow::Result<JobOutcome> {
        let err = JobError::new(
            "UNKNOWN_JOB_TYPE",
            format!("no handler registered for job type '{}'", job.job_type),
        );

        self.store
            .update_job_status(
                job.id,
                JobUpdate::new(JobStatus::Dead, attempts)
                    .last_error(err.to_string())
                    .completed_at(Utc::now()),
            )
            .await?;

        error!(job_id = %job.id, job_type = %job.job_type, "no handler registered, moved to dead");
        Ok(JobOutcome::Dead {
            attempts,
            reason: DeadReason::MissingHandler,
        })
    }
}
