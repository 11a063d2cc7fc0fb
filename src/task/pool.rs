//! Lookup table of live task actors.
//!
//! `lookup` resolves an id to its actor, creating one on demand (the actor
//! recovers any persisted state for that id). `get` resolves without
//! creating and is what the read/update paths use: an id nobody ever
//! created is simply not found.

use dashmap::DashMap;
use std::sync::{Arc, Weak};

use super::instance::TaskInstance;
use super::types::{Task, TaskUpdate};
use crate::balancer::service::LoadBalancer;
use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::runtime::clock::Clock;
use crate::runtime::ids::TaskId;
use crate::runtime::storage::MemoryBackend;
use crate::server::pool::ServerPool;
use crate::stats::aggregator::StatsRegistry;

pub struct TaskPool {
    weak: Weak<TaskPool>,
    clock: Arc<dyn Clock>,
    backend: Arc<MemoryBackend>,
    config: Arc<GatewayConfig>,
    balancer: Arc<LoadBalancer>,
    servers: Arc<ServerPool>,
    stats: Arc<StatsRegistry>,
    instances: DashMap<TaskId, Arc<TaskInstance>>,
}

impl TaskPool {
    pub fn new(
        clock: Arc<dyn Clock>,
        backend: Arc<MemoryBackend>,
        config: Arc<GatewayConfig>,
        balancer: Arc<LoadBalancer>,
        servers: Arc<ServerPool>,
        stats: Arc<StatsRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            clock,
            backend,
            config,
            balancer,
            servers,
            stats,
            instances: DashMap::new(),
        })
    }

    /// Resolves the actor for this id, creating it on demand.
    pub fn lookup(&self, id: &TaskId) -> Arc<TaskInstance> {
        self.instances
            .entry(id.clone())
            .or_insert_with(|| {
                TaskInstance::new(
                    id.clone(),
                    self.clock.clone(),
                    self.backend.namespace(&format!("task:{}", id)),
                    self.config.clone(),
                    self.balancer.clone(),
                    self.servers.clone(),
                    self.stats.clone(),
                    self.weak.clone(),
                )
            })
            .clone()
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<TaskInstance>> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    /// Applies a lifecycle update to an existing task.
    pub async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, ApiError> {
        let instance = self
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("task {}", id)))?;
        instance.update_task(update).await
    }

    pub(crate) fn remove(&self, id: &TaskId) {
        self.instances.remove(id);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
