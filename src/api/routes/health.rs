//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (ready to serve traffic)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::{ConnectionStats, HandoffStats, HealthResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

/// GET /health/live
///
/// Kubernetes liveness probe.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Returns 503 while the handoff queue is saturated, since updates are
/// being discarded.
pub async fn readiness(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    if handoff_saturated(&state) {
        return Err(ApiError::NotReady("handoff queue is full".to_string()));
    }
    Ok(StatusCode::OK)
}

/// GET /health
///
/// Full health status with component details.
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if handoff_saturated(&state) {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: ConnectionStats {
            total: state.registry.total_count().await,
            devices: state.registry.device_count().await,
        },
        device_sessions: state.devices.initialized_count().await,
        active_topics: state.subscriber.active_topics(),
        handoff: HandoffStats {
            queued: state.handoff.len(),
            capacity: state.handoff.capacity(),
            dropped: state.handoff.dropped(),
        },
    })
}

fn handoff_saturated(state: &AppState) -> bool {
    state.handoff.len() >= state.handoff.capacity()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let status = liveness().await;
        assert_eq!(status, StatusCode::OK);
    }
}
