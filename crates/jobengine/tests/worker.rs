mod common;

use common::wait_for_status;
use jobengine::jobs::{
    EnqueueOptions, HandlerOptions, JobError, JobStatus, JobStore, MemoryJobStore, QueueWorker,
    WorkerConfig, WorkerStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(queue: &str) -> WorkerConfig {
    WorkerConfig::new(format!("test-worker-{queue}"), queue)
        .poll_interval(Duration::from_millis(5))
        .heartbeat_interval(Duration::from_millis(20))
}

fn worker(store: &Arc<MemoryJobStore>, cfg: WorkerConfig) -> QueueWorker {
    QueueWorker::new(store.clone(), cfg)
}

/// Tracks how many handler invocations overlap.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn start_and_stop_are_idempotent_and_track_presence() {
    let store = Arc::new(MemoryJobStore::new());
    let worker = worker(&store, fast_config("default"));

    assert!(!worker.is_running());
    assert!(store.get_worker(worker.name()).await.unwrap().is_none());

    worker.start().await;
    worker.start().await;
    assert!(worker.is_running());

    let record = store.get_worker(worker.name()).await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Online);
    assert_eq!(record.queue, "default");

    worker.stop().await;
    worker.stop().await;
    assert!(!worker.is_running());

    let record = store.get_worker(worker.name()).await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Offline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_start_and_stop_leaves_no_background_tasks() {
    let store = Arc::new(MemoryJobStore::new());
    let worker = Arc::new(worker(&store, fast_config("default")));

    for _ in 0..50 {
        let (a, b) = (worker.clone(), worker.clone());
        let start = tokio::spawn(async move { a.start().await });
        let stop = tokio::spawn(async move { b.stop().await });
        start.await.unwrap();
        stop.await.unwrap();
    }
    worker.stop().await;
    assert!(!worker.is_running());

    // once stopped, nothing may keep refreshing the heartbeat
    let settled = store.get_worker(worker.name()).await.unwrap().unwrap();
    assert_eq!(settled.status, WorkerStatus::Offline);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = store.get_worker(worker.name()).await.unwrap().unwrap();
    assert_eq!(later.last_heartbeat_at, settled.last_heartbeat_at);
}

#[tokio::test]
async fn heartbeat_advances_while_running() {
    let store = Arc::new(MemoryJobStore::new());
    let worker = worker(&store, fast_config("default"));

    worker.start().await;
    let first = store
        .get_worker(worker.name())
        .await
        .unwrap()
        .unwrap()
        .last_heartbeat_at;

    tokio::time::sleep(Duration::from_millis(120)).await;

    let later = store
        .get_worker(worker.name())
        .await
        .unwrap()
        .unwrap()
        .last_heartbeat_at;
    assert!(later > first, "heartbeat did not move: {first} -> {later}");

    worker.stop().await;
}

#[tokio::test]
async fn runs_enqueued_jobs_to_completion() {
    let store = Arc::new(MemoryJobStore::new());
    let mut worker = worker(&store, fast_config("webhooks"));

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    worker.register_handler("webhook.deliver", move |ctx| {
        let sink = sink.clone();
        async move {
            let url: String = ctx
                .payload
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            sink.lock().unwrap().push(url);
            Ok::<(), JobError>(())
        }
    });

    worker.start().await;
    let id = worker
        .enqueue_job(
            "webhook.deliver",
            &json!({"url": "https://hooks.example/x"}),
            EnqueueOptions::new(),
        )
        .await
        .unwrap();

    let job = wait_for_status(store.as_ref(), id, JobStatus::Completed, WAIT).await;
    assert_eq!(job.attempts, 1);
    assert_eq!(*seen.lock().unwrap(), vec!["https://hooks.example/x".to_string()]);

    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);

    worker.stop().await;
}

#[tokio::test]
async fn stop_lets_in_flight_jobs_finish_and_claims_nothing_new() {
    let store = Arc::new(MemoryJobStore::new());
    let mut worker = worker(&store, fast_config("backups"));

    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    worker.register_handler("backup.retention", move |_ctx| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok::<(), JobError>(())
        }
    });

    worker.start().await;
    let first = worker
        .enqueue_job("backup.retention", &json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    wait_for_status(store.as_ref(), first, JobStatus::Running, WAIT).await;
    assert_eq!(worker.active_count().await, 1);

    worker.stop().await;

    let second = worker
        .enqueue_job("backup.retention", &json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    // in-flight job still owns its slot until the handler returns
    assert_eq!(worker.active_count().await, 1);
    release.notify_one();

    wait_for_status(store.as_ref(), first, JobStatus::Completed, WAIT).await;
    assert!(worker.wait_idle(WAIT).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let untouched = store.get_job(second).await.unwrap().unwrap();
    assert_eq!(untouched.status, JobStatus::Pending);
    assert_eq!(untouched.attempts, 0);
}

#[tokio::test]
async fn never_exceeds_max_concurrent() {
    let store = Arc::new(MemoryJobStore::new());
    let mut worker = worker(&store, fast_config("cloudpods").max_concurrent(2));

    let gauge = Arc::new(Gauge::default());
    let g = gauge.clone();
    worker.register_handler("pod.provision", move |_ctx| {
        let g = g.clone();
        async move {
            g.enter();
            tokio::time::sleep(Duration::from_millis(40)).await;
            g.exit();
            Ok::<(), JobError>(())
        }
    });

    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(
            worker
                .enqueue_job("pod.provision", &json!({"pod_id": n}), EnqueueOptions::new())
                .await
                .unwrap(),
        );
    }

    worker.start().await;
    for id in ids {
        wait_for_status(store.as_ref(), id, JobStatus::Completed, WAIT).await;
    }
    worker.stop().await;

    assert!(gauge.peak() <= 2, "peak concurrency was {}", gauge.peak());
    assert!(gauge.peak() >= 1);
}

#[tokio::test]
async fn per_type_concurrency_limit_is_enforced() {
    let store = Arc::new(MemoryJobStore::new());
    let mut worker = worker(&store, fast_config("dns").max_concurrent(4));

    let gauge = Arc::new(Gauge::default());
    let g = gauge.clone();
    worker.register_handler_with_options(
        "dns.record_sync",
        move |_ctx| {
            let g = g.clone();
            async move {
                g.enter();
                tokio::time::sleep(Duration::from_millis(20)).await;
                g.exit();
                Ok::<(), JobError>(())
            }
        },
        HandlerOptions::new().max_concurrency(1),
    );

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(
            worker
                .enqueue_job("dns.record_sync", &json!({}), EnqueueOptions::new())
                .await
                .unwrap(),
        );
    }

    worker.start().await;
    for id in ids {
        wait_for_status(store.as_ref(), id, JobStatus::Completed, WAIT).await;
    }
    worker.stop().await;

    assert_eq!(gauge.peak(), 1);
}

#[tokio::test]
async fn handler_timeout_fails_the_attempt() {
    let store = Arc::new(MemoryJobStore::new());
    let mut worker = worker(
        &store,
        fast_config("default").handler_timeout(Some(Duration::from_millis(50))),
    );

    worker.register_handler("slow", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), JobError>(())
    });

    worker.start().await;
    let id = worker
        .enqueue_job("slow", &json!({}), EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();

    let job = wait_for_status(store.as_ref(), id, JobStatus::Dead, WAIT).await;
    assert_eq!(job.attempts, 1);
    let err = job.last_error.unwrap();
    assert!(err.starts_with("TIMEOUT"), "{err}");

    worker.stop().await;
}

#[tokio::test]
async fn panicking_handler_is_recorded_as_a_failure() {
    let store = Arc::new(MemoryJobStore::new());
    let mut worker = worker(&store, fast_config("default"));

    worker.register_handler("explode", |_ctx| async {
        if true {
            panic!("kaboom");
        }
        Ok::<(), JobError>(())
    });
    worker.register_handler("fine", |_ctx| async { Ok::<(), JobError>(()) });

    worker.start().await;
    let bad = worker
        .enqueue_job("explode", &json!({}), EnqueueOptions::new().max_attempts(2))
        .await
        .unwrap();
    let good = worker
        .enqueue_job("fine", &json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    // first failure goes back to pending with a backoff
    let deadline = tokio::time::Instant::now() + WAIT;
    let job = loop {
        let job = store.get_job(bad).await.unwrap().unwrap();
        if job.attempts == 1 && job.status == JobStatus::Pending {
            break job;
        }
        assert!(tokio::time::Instant::now() < deadline, "failure never recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let err = job.last_error.unwrap();
    assert!(err.starts_with("PANIC"), "{err}");
    assert!(err.contains("kaboom"), "{err}");

    // the worker survived and keeps going
    wait_for_status(store.as_ref(), good, JobStatus::Completed, WAIT).await;
    assert!(worker.is_running());

    worker.stop().await;
}

#[tokio::test]
async fn admin_helpers_act_on_the_workers_queue() {
    let store = Arc::new(MemoryJobStore::new());
    let mut worker = worker(&store, fast_config("maintenance"));
    worker.register_handler("health.check", |_ctx| async {
        Err::<(), _>(JobError::new("UNHEALTHY", "probe failed"))
    });

    worker.start().await;
    let id = worker
        .enqueue_job("health.check", &json!({}), EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();
    wait_for_status(store.as_ref(), id, JobStatus::Dead, WAIT).await;
    worker.stop().await;

    assert_eq!(worker.stats().await.unwrap().dead, 1);
    assert_eq!(worker.retry_dead_jobs(10).await.unwrap(), 1);

    let job = worker.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());

    // nothing is old enough to clean up
    assert_eq!(worker.cleanup_old_jobs(7).await.unwrap(), 0);
}
