use jobengine::jobs::queues::job_types;
use jobengine::jobs::{HandlerOptions, HandlerRegistry, JobContext, JobError};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

#[derive(Deserialize)]
struct HealthCheckPayload {
    target: String,
    #[serde(default)]
    expect_status: Option<u16>,
}

async fn health_check(ctx: JobContext) -> Result<(), JobError> {
    let payload: HealthCheckPayload = ctx.payload_as()?;
    info!(
        job_id = %ctx.job_id,
        target = %payload.target,
        expect_status = ?payload.expect_status,
        attempt = ctx.attempts,
        "health check"
    );
    Ok(())
}

pub fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register_with_options(
        job_types::HEALTH_CHECK,
        health_check,
        HandlerOptions::new()
            .max_concurrency(50)
            .timeout(Duration::from_secs(10)),
    );

    registry
}
