use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Extra trusted proxy ranges currently loaded
    pub trusted_proxies: usize,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Readiness probe response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    /// Whether the node registry answered the probe lookup in time
    pub registry_reachable: bool,
}

/// Identity established by cluster authentication.
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    pub node_id: String,
    pub authenticated_at: DateTime<Utc>,
}
