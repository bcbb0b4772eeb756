//! Response bodies of the HTTP routes.

use serde::{Deserialize, Serialize};

/// Full health status
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy or degraded
    pub status: String,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
    pub connections: ConnectionStats,
    /// Device sessions with a provisioned, subscribed stream
    pub device_sessions: usize,
    /// Topics with a running worker
    pub active_topics: Vec<String>,
    pub handoff: HandoffStats,
}

/// Live WebSocket connections
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total: usize,
    /// Devices with at least one connection
    pub devices: usize,
}

/// Handoff queue between topic workers and the pump
#[derive(Debug, Serialize, Deserialize)]
pub struct HandoffStats {
    pub queued: usize,
    pub capacity: usize,
    /// Updates discarded because the queue was full
    pub dropped: u64,
}
