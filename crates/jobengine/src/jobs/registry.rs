use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use uuid::Uuid;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type HandlerFn = dyn Fn(JobContext) -> BoxFuture<Result<(), JobError>> + Send + Sync;

/// Failure reported by a handler. Stored on the job as `"<CODE>: <message>"`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct JobError {
    pub code: &'static str,
    pub message: String,
}

impl JobError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::new("HANDLER_ERROR", format!("{err:#}"))
    }
}

/// What a handler gets to see of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: Value,
    /// 1-based number of this attempt.
    pub attempts: i32,
    pub max_attempts: i32,
}

impl JobContext {
    /// Decode the payload into the shape this handler expects.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::new("BAD_PAYLOAD", e.to_string()))
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<HandlerFn>,
    pub semaphore: Option<Arc<Semaphore>>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

/// job type -> handler. Filled during setup, read-only once a worker runs.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, replacing any earlier registration.
    pub fn register<F, Fut>(&mut self, job_type: &str, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new());
    }

    pub fn register_with_timeout<F, Fut>(&mut self, job_type: &str, handler: F, timeout: Duration)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new().timeout(timeout));
    }

    pub fn register_with_options<F, Fut>(&mut self, job_type: &str, handler: F, opts: HandlerOptions)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let handler: Arc<HandlerFn> =
            Arc::new(move |ctx| -> BoxFuture<Result<(), JobError>> { Box::pin(handler(ctx)) });

        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler,
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl HandlerEntry {
    /// Runs the handler on its own task so a panic surfaces as `PANIC`
    /// instead of unwinding through the worker. `default_timeout` applies
    /// when the entry has none of its own.
    pub async fn run(&self, ctx: JobContext, default_timeout: Option<Duration>) -> Result<(), JobError> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| JobError::new("WORKER_SHUTDOWN", "handler semaphore closed"))?,
            ),
            None => None,
        };

        let mut task = tokio::spawn((self.handler)(ctx));

        let joined = match self.timeout.or(default_timeout) {
            Some(dur) => match tokio::time::timeout(dur, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(JobError::new(
                        "TIMEOUT",
                        format!("handler timeout after {}ms", dur.as_millis()),
                    ));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(res) => res,
            Err(e) if e.is_panic() => Err(JobError::new("PANIC", panic_message(e.into_panic()))),
            Err(e) => Err(JobError::new("CANCELLED", e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn ctx(payload: Value) -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            job_type: "t".into(),
            payload,
            attempts: 1,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn re_registration_overwrites() {
        let mut registry = HandlerRegistry::new();
        registry.register("t", |_ctx| async { Err::<(), _>(JobError::new("FIRST", "old")) });
        registry.register("t", |_ctx| async { Ok::<(), JobError>(()) });

        assert_eq!(registry.job_types(), vec!["t"]);
        let entry = registry.handler_for("t").unwrap();
        assert!(entry.run(ctx(json!({})), None).await.is_ok());
    }

    #[tokio::test]
    async fn panics_become_job_errors() {
        let mut registry = HandlerRegistry::new();
        registry.register("t", |_ctx| async {
            if true {
                panic!("boom");
            }
            Ok::<(), JobError>(())
        });

        let err = registry
            .handler_for("t")
            .unwrap()
            .run(ctx(json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, "PANIC");
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn handler_timeout_wins_over_default() {
        let mut registry = HandlerRegistry::new();
        registry.register_with_timeout(
            "slow",
            |_ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), JobError>(())
            },
            Duration::from_millis(20),
        );

        let err = registry
            .handler_for("slow")
            .unwrap()
            .run(ctx(json!({})), Some(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
    }

    #[tokio::test]
    async fn default_timeout_applies_without_handler_timeout() {
        let mut registry = HandlerRegistry::new();
        registry.register("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), JobError>(())
        });

        let err = registry
            .handler_for("slow")
            .unwrap()
            .run(ctx(json!({})), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
    }

    #[test]
    fn payload_decoding_reports_bad_payload() {
        #[derive(Debug, Deserialize)]
        struct Provision {
            #[allow(dead_code)]
            pod_id: i64,
        }

        assert!(ctx(json!({"pod_id": 7})).payload_as::<Provision>().is_ok());
        let err = ctx(json!({"pod": "x"})).payload_as::<Provision>().unwrap_err();
        assert_eq!(err.code, "BAD_PAYLOAD");
        assert_eq!(err.to_string().split(':').next(), Some("BAD_PAYLOAD"));
    }
}
