pub mod config;
pub mod db;
pub mod jobs;

pub use jobs::{
    enqueue, EnqueueOptions, HandlerRegistry, Job, JobContext, JobError, JobStatus, JobStore,
    MemoryJobStore, PgJobStore, QueueStats, QueueWorker, WorkerConfig,
};
