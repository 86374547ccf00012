//! Health endpoint (§4.K, §7) — the pipeline's only user-visible error
//! surface besides per-kind counters. The verdict itself is computed by
//! whoever owns lifecycle (the daemon's supervisor); this module only
//! renders it as JSON.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use meshgate_core::metrics::MetricsSnapshot;

use crate::ApiState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: Health,
    pub issues: Vec<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: Health::Healthy,
            issues: Vec::new(),
        }
    }
}

/// Implemented by the supervisor; queried fresh on every `/health` request
/// rather than polled into a cache, since the checks themselves (queue
/// depth, broker connection flag, last-message clock, writer flag) are all
/// cheap atomic reads.
pub trait HealthSource: Send + Sync {
    fn current(&self) -> HealthStatus;
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthStatus> {
    Json(state.health.current())
}

pub async fn handle_metrics(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
