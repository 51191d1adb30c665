//! Health and readiness endpoints.
//!
//! - **Health** (`/health`): Returns 200 while the process is serving
//! - **Readiness** (`/ready`): Returns 503 if the node registry cannot be
//!   queried, since every internal cluster request would then be refused
//!
//! Both are on the default rate limit skip list.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{instrument, warn};

use crate::models::{HealthResponse, ReadinessResponse};
use crate::state::AppState;

/// Node id looked up by the readiness probe; whether it exists is irrelevant.
const READINESS_PROBE_NODE: &str = "__readiness_probe__";

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "trusted_proxies": 0,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        trusted_proxies: state.trust.snapshot().len(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Probes the node registry with the configured lookup deadline.
#[instrument(skip(state))]
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let registry_reachable = probe_registry(&state, state.config.registry_timeout).await;

    let status = if registry_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: registry_reachable,
            registry_reachable,
        }),
    )
}

async fn probe_registry(state: &AppState, deadline: Duration) -> bool {
    match tokio::time::timeout(deadline, state.registry.find_active_node(READINESS_PROBE_NODE)).await
    {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "Readiness: node registry query failed");
            false
        }
        Err(_) => {
            warn!("Readiness: node registry query timed out");
            false
        }
    }
}
