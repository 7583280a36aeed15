use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_minutes: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_minutes: 60 }
    }
}

/// `min(cap, 2^attempts)` minutes.
pub fn backoff_minutes(attempts: i32, cfg: &RetryConfig) -> i64 {
    let exp = attempts.max(0) as u32;

    // 2^exp, saturating; the cap takes over long before overflow matters.
    let pow2 = 1_i64.checked_shl(exp).filter(|v| *v > 0).unwrap_or(i64::MAX);

    pow2.min(cfg.max_minutes)
}

pub fn next_scheduled_at(now: DateTime<Utc>, attempts: i32, cfg: &RetryConfig) -> DateTime<Utc> {
    now + Duration::minutes(backoff_minutes(attempts, cfg))
}
