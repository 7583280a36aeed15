pub mod admin;
pub mod memory;
pub mod model;
pub mod queues;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

pub use admin::{cleanup_old_jobs, cutoff_days, enqueue, queue_stats, retry_dead_jobs};
pub use memory::MemoryJobStore;
pub use model::{
    EnqueueOptions, Job, JobStatus, JobUpdate, NewJob, QueueStats, WorkerRecord, WorkerStatus,
};
pub use registry::{HandlerOptions, HandlerRegistry, JobContext, JobError};
pub use repo::PgJobStore;
pub use retry::RetryConfig;
pub use runner::{DeadReason, JobOutcome, JobRunner};
pub use store::JobStore;
pub use worker::{ActiveJob, QueueWorker, WorkerConfig};
