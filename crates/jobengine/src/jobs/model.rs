use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
pub const DEFAULT_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub priority: i32,

    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Pending and due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub max_attempts: i32,
}

/// Optional knobs for `enqueue`. Unset fields fall back to "now", 5 attempts
/// and priority 0.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub priority: Option<i32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn priority(mut self, p: i32) -> Self {
        self.priority = Some(p);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => anyhow::bail!("unknown job status: {other}"),
        }
    }
}

/// Outcome write-back for a single job.
///
/// `last_error` is written as given (`None` clears it). The optional
/// timestamps leave the stored value untouched when `None`.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn new(status: JobStatus, attempts: i32) -> Self {
        Self {
            status,
            attempts,
            last_error: None,
            scheduled_at: None,
            completed_at: None,
            started_at: None,
        }
    }

    pub fn last_error(mut self, err: impl Into<String>) -> Self {
        self.last_error = Some(err.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Point-in-time job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

impl QueueStats {
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Running => self.running += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed + self.dead
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(WorkerStatus::Online),
            "offline" => Ok(WorkerStatus::Offline),
            other => anyhow::bail!("unknown worker status: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub queue: String,
    pub status: WorkerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
}
