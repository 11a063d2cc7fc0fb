use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::runtime::ids::ServerId;

/// Server-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    ResponseTime,
    Random,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::RoundRobin
    }
}

/// What a task brings to server selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub task_type: Option<String>,
    pub priority: Option<u8>,
    pub required_capabilities: Vec<String>,
}

/// Metric snapshot pushed by a server instance after dispatches and health
/// checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetricsUpdate {
    pub healthy: bool,
    pub active_tasks: u32,
    pub max_concurrent: u32,
    pub capabilities: HashSet<String>,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    /// Set when this update closes out a dispatch; decrements the cached
    /// in-flight load.
    #[serde(default)]
    pub task_completed: bool,
}

/// The balancer's cached view of one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMetrics {
    pub healthy: bool,
    pub active_tasks: u32,
    pub max_concurrent: u32,
    pub capabilities: HashSet<String>,
    pub success_rate: f64,
    /// None until the server has reported at least one measurement; the
    /// response-time algorithm ranks unknowns last.
    pub average_response_time_ms: Option<f64>,
    pub last_update: u64,
}

/// Real cached values surfaced by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerStatus {
    pub algorithm: Algorithm,
    pub healthy_servers: Vec<ServerId>,
    pub server_loads: HashMap<String, u32>,
}
