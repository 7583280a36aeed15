use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jobs::{
    admin,
    model::{EnqueueOptions, Job, QueueStats, WorkerStatus},
    registry::{HandlerOptions, HandlerRegistry, JobContext, JobError},
    retry::RetryConfig,
    runner::JobRunner,
    store::JobStore,
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub queue: String,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Applies to handlers registered without a timeout of their own.
    pub handler_timeout: Option<Duration>,
    pub retry: RetryConfig,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            max_concurrent: 5,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            handler_timeout: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn poll_interval(mut self, dur: Duration) -> Self {
        self.poll_interval = dur;
        self
    }

    pub fn heartbeat_interval(mut self, dur: Duration) -> Self {
        self.heartbeat_interval = dur.max(Duration::from_millis(1));
        self
    }

    pub fn handler_timeout(mut self, dur: Option<Duration>) -> Self {
        self.handler_timeout = dur;
        self
    }
}

/// A job this worker is executing right now.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_type: String,
    pub attempts: i32,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tasks {
    poll: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Worker loop for one queue: claims eligible jobs up to `max_concurrent`,
/// runs them on spawned tasks and reports liveness on its own timer.
pub struct QueueWorker {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    cfg: WorkerConfig,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    active: Arc<Mutex<HashMap<Uuid, ActiveJob>>>,
    tasks: Mutex<Tasks>,
}

impl QueueWorker {
    pub fn new(store: Arc<dyn JobStore>, cfg: WorkerConfig) -> Self {
        Self::with_registry(store, HandlerRegistry::new(), cfg)
    }

    pub fn with_registry(store: Arc<dyn JobStore>, registry: HandlerRegistry, cfg: WorkerConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            cfg,
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn queue(&self) -> &str {
        &self.cfg.queue
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ----------------------------
    // Handler registration (setup only)
    // ----------------------------

    /// Takes `&mut self`: registration cannot race a running loop. A loop
    /// that is already started keeps the registry it started with.
    pub fn register_handler<F, Fut>(&mut self, job_type: &str, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Arc::make_mut(&mut self.registry).register(job_type, handler);
    }

    pub fn register_handler_with_options<F, Fut>(
        &mut self,
        job_type: &str,
        handler: F,
        opts: HandlerOptions,
    ) where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Arc::make_mut(&mut self.registry).register_with_options(job_type, handler, opts);
    }

    // ----------------------------
    // Lifecycle
    // ----------------------------

    /// No-op when already running.
    pub async fn start(&self) {
        // Held across the flag flip and the spawns so a concurrent stop()
        // always finds the handles it has to shut down.
        let mut tasks = self.tasks.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self
            .store
            .upsert_worker(&self.cfg.name, &self.cfg.queue, WorkerStatus::Online, Utc::now())
            .await
        {
            warn!(worker = %self.cfg.name, queue = %self.cfg.queue, error = %e, "worker registration failed");
        }

        tasks.heartbeat = Some(tokio::spawn(heartbeat_loop(
            Arc::clone(&self.store),
            self.cfg.name.clone(),
            self.cfg.heartbeat_interval,
        )));
        tasks.poll = Some(tokio::spawn(poll_loop(PollLoop {
            store: Arc::clone(&self.store),
            runner: JobRunner::new(
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.cfg.retry.clone(),
                self.cfg.handler_timeout,
            ),
            cfg: self.cfg.clone(),
            running: Arc::clone(&self.running),
            wake: Arc::clone(&self.wake),
            active: Arc::clone(&self.active),
        })));

        info!(
            worker = %self.cfg.name,
            queue = %self.cfg.queue,
            max_concurrent = self.cfg.max_concurrent,
            handlers = ?self.registry.job_types(),
            "worker started"
        );
    }

    /// Stops claiming. Jobs already dispatched keep running to completion.
    pub async fn stop(&self) {
        let (poll, heartbeat) = {
            let mut tasks = self.tasks.lock().await;
            if !self.running.swap(false, Ordering::SeqCst) {
                return;
            }
            self.wake.notify_one();
            (tasks.poll.take(), tasks.heartbeat.take())
        };

        if let Some(handle) = heartbeat {
            handle.abort();
        }
        if let Some(handle) = poll {
            if let Err(e) = handle.await {
                error!(worker = %self.cfg.name, error = %e, "poll loop ended abnormally");
            }
        }

        if let Err(e) = self
            .store
            .upsert_worker(&self.cfg.name, &self.cfg.queue, WorkerStatus::Offline, Utc::now())
            .await
        {
            warn!(worker = %self.cfg.name, error = %e, "failed to mark worker offline");
        }

        info!(worker = %self.cfg.name, queue = %self.cfg.queue, "worker stopped");
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn active_jobs(&self) -> HashMap<Uuid, ActiveJob> {
        self.active.lock().await.clone()
    }

    /// Waits until no dispatched job is executing, up to `timeout`.
    /// Returns `false` if jobs were still running when time ran out.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count().await == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ----------------------------
    // Queue administration
    // ----------------------------

    pub async fn enqueue_job<P>(
        &self,
        job_type: &str,
        payload: &P,
        opts: EnqueueOptions,
    ) -> anyhow::Result<Uuid>
    where
        P: Serialize + ?Sized,
    {
        admin::enqueue(self.store.as_ref(), &self.cfg.queue, job_type, payload, opts).await
    }

    pub async fn stats(&self) -> anyhow::Result<QueueStats> {
        admin::queue_stats(self.store.as_ref(), &self.cfg.queue).await
    }

    pub async fn retry_dead_jobs(&self, max_count: i64) -> anyhow::Result<u64> {
        admin::retry_dead_jobs(self.store.as_ref(), &self.cfg.queue, max_count).await
    }

    pub async fn cleanup_old_jobs(&self, days_old: i64) -> anyhow::Result<u64> {
        admin::cleanup_old_jobs(self.store.as_ref(), &self.cfg.queue, days_old).await
    }

    pub async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        self.store.get_job(id).await
    }
}

struct PollLoop {
    store: Arc<dyn JobStore>,
    runner: JobRunner,
    cfg: WorkerConfig,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    active: Arc<Mutex<HashMap<Uuid, ActiveJob>>>,
}

async fn poll_loop(ctx: PollLoop) {
    while ctx.running.load(Ordering::SeqCst) {
        let has_slot = ctx.active.lock().await.len() < ctx.cfg.max_concurrent;

        if has_slot {
            match ctx.store.claim_next_pending(&ctx.cfg.queue, Utc::now()).await {
                Ok(Some(job)) => dispatch(&ctx, job).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = %ctx.cfg.name, queue = %ctx.cfg.queue, error = %e, "claim failed");
                }
            }
        }

        // Fixed interval whether or not a slot was free; stop() cuts it short.
        tokio::select! {
            _ = tokio::time::sleep(ctx.cfg.poll_interval) => {}
            _ = ctx.wake.notified() => {}
        }
    }

    debug!(worker = %ctx.cfg.name, queue = %ctx.cfg.queue, "poll loop exited");
}

async fn dispatch(ctx: &PollLoop, job: Job) {
    let job_id = job.id;
    ctx.active.lock().await.insert(
        job_id,
        ActiveJob {
            job_type: job.job_type.clone(),
            attempts: job.attempts + 1,
            started_at: job.started_at.unwrap_or_else(Utc::now),
        },
    );

    debug!(
        worker = %ctx.cfg.name,
        job_id = %job_id,
        job_type = %job.job_type,
        priority = job.priority,
        "claimed job"
    );

    let runner = ctx.runner.clone();
    let active = Arc::clone(&ctx.active);
    let worker = ctx.cfg.name.clone();

    tokio::spawn(async move {
        if let Err(e) = runner.run_job(job).await {
            error!(worker = %worker, job_id = %job_id, error = %e, "failed to record job outcome");
        }
        active.lock().await.remove(&job_id);
    });
}

async fn heartbeat_loop(store: Arc<dyn JobStore>, name: String, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick fires immediately; start() already wrote a fresh heartbeat
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = store.update_worker_heartbeat(&name, Utc::now()).await {
            warn!(worker = %name, error = %e, "heartbeat failed");
        }
    }
}
