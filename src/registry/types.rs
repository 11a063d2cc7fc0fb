use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::runtime::ids::ServerId;
use crate::server::types::{ServerConfig, ServerEndpoints, ServerStatus};

/// What the registry stores per server. Derived age fields are computed at
/// read time, not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub registered_at: u64,
    pub last_heartbeat: u64,
}

/// The projection returned to callers: the stored record plus derived ages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(flatten)]
    pub config: ServerConfig,
    pub status: ServerStatus,
    pub registered_at: u64,
    pub last_heartbeat: u64,
    pub uptime_ms: u64,
    pub time_since_last_heartbeat_ms: u64,
}

impl ServerInfo {
    pub fn project(record: &ServerRecord, now: u64) -> Self {
        Self {
            config: record.config.clone(),
            status: record.status,
            registered_at: record.registered_at,
            last_heartbeat: record.last_heartbeat,
            uptime_ms: now.saturating_sub(record.registered_at),
            time_since_last_heartbeat_ms: now.saturating_sub(record.last_heartbeat),
        }
    }
}

/// Optional filters for fleet listings.
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub status: Option<ServerStatus>,
    pub group: Option<String>,
    /// Maximum heartbeat age in milliseconds.
    pub max_age_ms: Option<u64>,
}

/// Registration payload: a server configuration whose id may be omitted and
/// generated by the registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub endpoints: ServerEndpoints,
    #[serde(default)]
    pub api_key: Option<String>,
    pub max_concurrent: u32,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub groups: HashSet<String>,
    #[serde(default)]
    pub priority: u8,
}

impl RegisterServerRequest {
    /// Fixes the server id (generating one if absent) and produces the
    /// immutable configuration.
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .map(ServerId)
                .unwrap_or_default(),
            name: self.name,
            endpoints: self.endpoints,
            api_key: self.api_key,
            max_concurrent: self.max_concurrent,
            capabilities: self.capabilities,
            groups: self.groups,
            priority: self.priority,
        }
    }
}
