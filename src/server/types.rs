use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ApiError;
use crate::runtime::ids::ServerId;

/// Lifecycle state of a server, shared between the per-instance runtime
/// state machine and the registry's fleet view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Initializing,
    Online,
    Degraded,
    Offline,
    Maintenance,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Initializing => "initializing",
            ServerStatus::Online => "online",
            ServerStatus::Degraded => "degraded",
            ServerStatus::Offline => "offline",
            ServerStatus::Maintenance => "maintenance",
        }
    }
}

/// Worker endpoints. `predict` receives dispatches, `health` is probed by
/// the health loop, `metrics` is optional and only ever forwarded to
/// operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEndpoints {
    pub predict: String,
    pub health: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
}

/// Immutable per-server configuration, fixed at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    pub endpoints: ServerEndpoints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_concurrent: u32,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub groups: HashSet<String>,
    #[serde(default)]
    pub priority: u8,
}

impl ServerConfig {
    /// Rejects configurations the fleet cannot operate with.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::Validation("server name must not be empty".into()));
        }
        if self.max_concurrent < 1 {
            return Err(ApiError::Validation(
                "maxConcurrent must be at least 1".into(),
            ));
        }
        if self.priority > 10 {
            return Err(ApiError::Validation(
                "priority must be between 0 and 10".into(),
            ));
        }
        for url in [&self.endpoints.predict, &self.endpoints.health] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ApiError::Validation(format!(
                    "endpoint '{}' must be an absolute http(s) URL",
                    url
                )));
            }
        }
        Ok(())
    }
}

/// Cumulative dispatch counters for one server.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeMetrics {
    pub tasks_processed: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

impl CumulativeMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.tasks_processed == 0 {
            return 1.0;
        }
        self.successes as f64 / self.tasks_processed as f64
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.tasks_processed == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.tasks_processed as f64
    }

    pub fn record(&mut self, success: bool, duration_ms: u64) {
        self.tasks_processed += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration_ms += duration_ms;
    }
}

/// Point-in-time view of one server's runtime state, as returned by the
/// metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub server_id: ServerId,
    pub status: ServerStatus,
    pub healthy: bool,
    pub health_score: u32,
    pub tasks_processed: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub active_tasks: u32,
    pub max_concurrent: u32,
    pub capabilities: HashSet<String>,
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub status: ServerStatus,
    pub health_score: u32,
    pub check_interval_ms: u64,
}

/// What a backend worker receives on dispatch. This body is the gateway's
/// outbound wire contract and stays snake_case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub task_id: String,
    pub request: serde_json::Value,
    pub callback_url: String,
}
