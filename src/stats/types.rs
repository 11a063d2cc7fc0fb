use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::runtime::ids::{ServerId, TaskId};

/// A buffered statistics event. Events are value objects; once recorded they
/// are immutable and ride the next flush to storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskEvent {
    Start {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(rename = "serverId")]
        server_id: ServerId,
        timestamp: u64,
    },
    Complete {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(rename = "serverId")]
        server_id: Option<ServerId>,
        success: bool,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        retries: u32,
        timestamp: u64,
    },
}

/// What the task lifecycle reports when a task reaches a terminal status.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub task_id: TaskId,
    pub server_id: Option<ServerId>,
    pub success: bool,
    pub duration_ms: u64,
    pub retries: u32,
}

/// Day-level aggregate counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub total_tasks: u64,
    pub pending_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub retried_tasks: u64,
    pub total_success_duration_ms: u64,
    pub average_processing_time_ms: f64,
}

/// Per-server counters for one day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatistics {
    pub tasks_processed: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_active: u64,
}

/// Counters for one hour of the day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HourlyStats {
    pub tasks: u64,
    pub completed: u64,
    pub failed: u64,
}

/// One row of the hourly report, labeled `"H:00-H:59"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyReport {
    pub period: String,
    pub tasks: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopServer {
    pub server_id: String,
    pub tasks_processed: u64,
}

/// The full statistics projection returned by `getStats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    #[serde(flatten)]
    pub totals: AggregateStats,
    pub top_servers: Vec<TopServer>,
    pub hourly_trend: Vec<HourlyReport>,
}

/// Internal mutable rollup state for one day.
#[derive(Debug, Default)]
pub struct DayRollup {
    pub stats: AggregateStats,
    pub server_stats: BTreeMap<String, ServerStatistics>,
    pub hourly: BTreeMap<u32, HourlyStats>,
}
