use std::time::Duration;

use crate::jobs::WorkerConfig;

/// Runtime configuration for a worker process, loaded from the environment
/// (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_name: String,
    pub queues: Vec<String>,
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_secs: u64,
    pub handler_timeout_secs: Option<u64>,
    pub migrate_on_startup: bool,
    pub cleanup_after_days: i64,
    pub cleanup_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_name = env_or_fallback("JOBENGINE_WORKER_NAME", "WORKER_NAME")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let queues = env_or_fallback("JOBENGINE_QUEUES", "QUEUES")
            .map(|s| parse_list(&s))
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| vec!["default".to_string()]);

        let max_concurrent = env_parse::<usize>("JOBENGINE_MAX_CONCURRENT").unwrap_or(5).max(1);
        let poll_interval_ms = env_parse::<u64>("JOBENGINE_POLL_INTERVAL_MS").unwrap_or(1000).max(10);
        let heartbeat_secs = env_parse::<u64>("JOBENGINE_HEARTBEAT_SECS").unwrap_or(30).max(1);
        let handler_timeout_secs =
            env_parse::<u64>("JOBENGINE_HANDLER_TIMEOUT_SECS").filter(|s| *s > 0);

        let migrate_on_startup = env_bool("JOBENGINE_MIGRATE_ON_STARTUP").unwrap_or(false);

        let cleanup_after_days = env_parse::<i64>("JOBENGINE_CLEANUP_AFTER_DAYS").unwrap_or(7);
        let cleanup_interval_secs = env_parse::<u64>("JOBENGINE_CLEANUP_INTERVAL_SECS")
            .unwrap_or(3600)
            .max(1);
        let shutdown_grace_secs = env_parse::<u64>("JOBENGINE_SHUTDOWN_GRACE_SECS").unwrap_or(30);

        Ok(Self {
            database_url,
            worker_name,
            queues,
            max_concurrent,
            poll_interval_ms,
            heartbeat_secs,
            handler_timeout_secs,
            migrate_on_startup,
            cleanup_after_days,
            cleanup_interval_secs,
            shutdown_grace_secs,
        })
    }

    /// Worker settings for one queue. With several queues the worker name is
    /// suffixed with the queue so each registration stays unique.
    pub fn worker_config(&self, queue: &str) -> WorkerConfig {
        let name = if self.queues.len() > 1 {
            format!("{}:{}", self.worker_name, queue)
        } else {
            self.worker_name.clone()
        };

        WorkerConfig::new(name, queue)
            .max_concurrent(self.max_concurrent)
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
            .heartbeat_interval(Duration::from_secs(self.heartbeat_secs))
            .handler_timeout(self.handler_timeout_secs.map(Duration::from_secs))
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
