use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::types::*;
use crate::balancer::service::LoadBalancer;
use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::runtime::clock::Clock;
use crate::runtime::ids::ServerId;
use crate::runtime::storage::Storage;
use crate::server::pool::ServerPool;
use crate::server::types::{ServerConfig, ServerStatus};

/// The "global" fleet-membership actor.
pub struct ServerRegistry {
    clock: Arc<dyn Clock>,
    store: Arc<dyn Storage>,
    balancer: Arc<LoadBalancer>,
    pool: Arc<ServerPool>,
    stale_threshold_ms: u64,
    cleanup_interval_ms: u64,
    state: Mutex<RegistryState>,
}

struct RegistryState {
    servers: HashMap<ServerId, ServerRecord>,
    groups: HashMap<String, HashSet<ServerId>>,
}

impl ServerRegistry {
    pub fn new(
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Storage>,
        balancer: Arc<LoadBalancer>,
        pool: Arc<ServerPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            store,
            balancer,
            pool,
            stale_threshold_ms: config.stale_threshold_ms,
            cleanup_interval_ms: config.cleanup_interval_ms,
            state: Mutex::new(RegistryState {
                servers: HashMap::new(),
                groups: HashMap::new(),
            }),
        })
    }

    /// Spawns the periodic stale-server sweep.
    pub fn start(self: &Arc<Self>) {
        let registry = self.clone();
        let interval = Duration::from_millis(self.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = registry.cleanup_stale_servers().await;
                if !removed.is_empty() {
                    tracing::info!("stale sweep evicted {} server(s)", removed.len());
                }
            }
        });
    }

    /// Admits a server to the fleet. Instantiates (or re-initializes) its
    /// instance first; any initialization error aborts the registration.
    /// Registering the same id again is idempotent.
    pub async fn register_server(&self, config: ServerConfig) -> Result<ServerId, ApiError> {
        config.validate()?;
        let id = config.id.clone();

        self.pool.initialize(config.clone()).await?;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = self.clock.now_ms();

            if let Some(existing) = state.servers.get(&id) {
                tracing::info!("server {} re-registered", id);
                let previous_groups = existing.config.groups.clone();
                for group in &previous_groups {
                    if let Some(members) = state.groups.get_mut(group) {
                        members.remove(&id);
                        if members.is_empty() {
                            state.groups.remove(group);
                        }
                    }
                }
            } else {
                tracing::info!("server {} registered ({})", id, config.name);
            }

            for group in &config.groups {
                state
                    .groups
                    .entry(group.clone())
                    .or_default()
                    .insert(id.clone());
            }

            state.servers.insert(
                id.clone(),
                ServerRecord {
                    config,
                    status: ServerStatus::Online,
                    registered_at: now,
                    last_heartbeat: now,
                },
            );

            self.persist(state);
        }

        self.notify_rebalance();
        Ok(id)
    }

    /// Removes a server from the fleet. Shutdown failures are logged and
    /// swallowed: membership is the authority, not the instance. Unknown
    /// ids are a no-op success.
    pub async fn unregister_server(&self, id: &ServerId) {
        if let Err(err) = self.pool.shutdown(id).await {
            tracing::warn!("shutdown of server {} failed during unregister: {}", id, err);
        }

        let removed = {
            let mut state = self.state.lock().await;
            match state.servers.remove(id) {
                Some(record) => {
                    remove_from_groups(&mut state.groups, &record.config, id);
                    self.persist(&state);
                    true
                }
                None => false,
            }
        };

        if removed {
            tracing::info!("server {} unregistered", id);
            self.notify_rebalance();
        } else {
            tracing::debug!("unregister of unknown server {} ignored", id);
        }
    }

    /// Lists the fleet. Servers silent past the stale threshold are
    /// reclassified offline before filtering; returned records carry derived
    /// uptime and heartbeat-age fields.
    pub async fn get_available_servers(&self, filter: &ServerFilter) -> Vec<ServerInfo> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        let mut reclassified = false;
        for (id, record) in state.servers.iter_mut() {
            if record.status != ServerStatus::Offline
                && now.saturating_sub(record.last_heartbeat) > self.stale_threshold_ms
            {
                tracing::warn!(
                    "server {} silent for {}ms, reclassifying offline",
                    id,
                    now.saturating_sub(record.last_heartbeat)
                );
                record.status = ServerStatus::Offline;
                reclassified = true;
            }
        }
        if reclassified {
            self.persist(&state);
        }

        let mut servers: Vec<ServerInfo> = state
            .servers
            .values()
            .filter(|record| {
                if let Some(status) = filter.status {
                    if record.status != status {
                        return false;
                    }
                }
                if let Some(group) = &filter.group {
                    if !record.config.groups.contains(group) {
                        return false;
                    }
                }
                if let Some(max_age) = filter.max_age_ms {
                    if now.saturating_sub(record.last_heartbeat) > max_age {
                        return false;
                    }
                }
                true
            })
            .map(|record| ServerInfo::project(record, now))
            .collect();

        servers.sort_by(|a, b| a.config.id.0.cmp(&b.config.id.0));
        servers
    }

    /// Records a heartbeat. A heartbeat from an offline server brings it
    /// back online.
    pub async fn update_heartbeat(&self, id: &ServerId) -> Result<(), ApiError> {
        let revived = {
            let mut state = self.state.lock().await;
            let record = state
                .servers
                .get_mut(id)
                .ok_or_else(|| ApiError::NotFound(format!("server {}", id)))?;

            record.last_heartbeat = self.clock.now_ms();
            let revived = record.status == ServerStatus::Offline;
            if revived {
                tracing::info!("server {} offline -> online (heartbeat)", id);
                record.status = ServerStatus::Online;
            }
            self.persist(&state);
            revived
        };

        if revived {
            self.notify_rebalance();
        }
        Ok(())
    }

    /// Mirrors a runtime status transition reported by a server instance.
    pub async fn update_server_status(&self, id: &ServerId, status: ServerStatus) {
        let mut state = self.state.lock().await;
        let Some(record) = state.servers.get_mut(id) else {
            tracing::debug!("status update for unknown server {} ignored", id);
            return;
        };
        if record.status != status {
            tracing::info!(
                "server {} {} -> {} (instance report)",
                id,
                record.status.as_str(),
                status.as_str()
            );
            record.status = status;
            self.persist(&state);
        }
    }

    /// Evicts every server whose heartbeat is older than the stale
    /// threshold; returns the removed ids.
    pub async fn cleanup_stale_servers(&self) -> Vec<ServerId> {
        let now = self.clock.now_ms();

        let stale: Vec<(ServerId, ServerRecord)> = {
            let mut state = self.state.lock().await;
            let ids: Vec<ServerId> = state
                .servers
                .iter()
                .filter(|(_, record)| {
                    now.saturating_sub(record.last_heartbeat) > self.stale_threshold_ms
                })
                .map(|(id, _)| id.clone())
                .collect();

            let mut removed = Vec::new();
            for id in ids {
                if let Some(record) = state.servers.remove(&id) {
                    remove_from_groups(&mut state.groups, &record.config, &id);
                    removed.push((id, record));
                }
            }
            if !removed.is_empty() {
                self.persist(&state);
            }
            removed
        };

        if stale.is_empty() {
            return Vec::new();
        }

        let mut removed_ids = Vec::new();
        for (id, _) in stale {
            tracing::warn!("evicting stale server {}", id);
            if let Err(err) = self.pool.shutdown(&id).await {
                tracing::warn!("shutdown of stale server {} failed: {}", id, err);
            }
            removed_ids.push(id);
        }

        self.notify_rebalance();
        removed_ids
    }

    /// Fire-and-forget rebalance request; failures are logged, never fatal.
    fn notify_rebalance(&self) {
        let balancer = self.balancer.clone();
        tokio::spawn(async move {
            if let Err(err) = balancer.rebalance().await {
                tracing::warn!("rebalance notification failed: {}", err);
            }
        });
    }

    fn persist(&self, state: &RegistryState) {
        let servers: HashMap<String, &ServerRecord> = state
            .servers
            .iter()
            .map(|(id, record)| (id.0.clone(), record))
            .collect();
        let groups: HashMap<String, Vec<String>> = state
            .groups
            .iter()
            .map(|(group, ids)| {
                let mut ids: Vec<String> = ids.iter().map(|id| id.0.clone()).collect();
                ids.sort();
                (group.clone(), ids)
            })
            .collect();

        let entries = vec![
            ("servers".to_string(), json!(servers)),
            ("groups".to_string(), json!(groups)),
        ];
        if let Err(err) = self.store.put_many(entries) {
            tracing::warn!("failed to persist registry state: {}", err);
        }
    }
}

fn remove_from_groups(
    groups: &mut HashMap<String, HashSet<ServerId>>,
    config: &ServerConfig,
    id: &ServerId,
) {
    for group in &config.groups {
        if let Some(members) = groups.get_mut(group) {
            members.remove(id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }
}
