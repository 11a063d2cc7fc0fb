//! Lookup table of live server instances.
//!
//! The registry drives this pool: registering a server creates (or
//! re-initializes) its instance, unregistering shuts it down. Everyone else
//! only resolves handles by id.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

use super::instance::ServerInstance;
use super::types::ServerConfig;
use crate::balancer::service::LoadBalancer;
use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::registry::service::ServerRegistry;
use crate::runtime::clock::Clock;
use crate::runtime::ids::ServerId;
use crate::runtime::storage::MemoryBackend;
use crate::task::pool::TaskPool;

pub struct ServerPool {
    clock: Arc<dyn Clock>,
    backend: Arc<MemoryBackend>,
    http: reqwest::Client,
    balancer: Arc<LoadBalancer>,
    registry: Arc<OnceLock<Arc<ServerRegistry>>>,
    tasks: Arc<OnceLock<Arc<TaskPool>>>,
    min_check_interval_ms: u64,
    max_check_interval_ms: u64,
    instances: DashMap<ServerId, Arc<ServerInstance>>,
}

impl ServerPool {
    pub fn new(
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
        backend: Arc<MemoryBackend>,
        balancer: Arc<LoadBalancer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            backend,
            http: reqwest::Client::new(),
            balancer,
            registry: Arc::new(OnceLock::new()),
            tasks: Arc::new(OnceLock::new()),
            min_check_interval_ms: config.min_health_check_interval_ms,
            max_check_interval_ms: config.max_health_check_interval_ms,
            instances: DashMap::new(),
        })
    }

    /// Installs the registry back-edge, shared by every instance.
    pub fn bind_registry(&self, registry: Arc<ServerRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Installs the task-pool back-edge used by the synchronous result path.
    pub fn bind_tasks(&self, tasks: Arc<TaskPool>) {
        let _ = self.tasks.set(tasks);
    }

    /// Creates the instance for this configuration (or reuses the existing
    /// one) and runs `initialize` on it. Repeated registration re-runs
    /// initialize on the same actor.
    pub async fn initialize(&self, config: ServerConfig) -> Result<(), ApiError> {
        let id = config.id.clone();

        let instance = self
            .instances
            .entry(id.clone())
            .or_insert_with(|| {
                ServerInstance::new(
                    config.clone(),
                    self.clock.clone(),
                    self.backend.namespace(&format!("server:{}", id)),
                    self.http.clone(),
                    self.balancer.clone(),
                    self.registry.clone(),
                    self.tasks.clone(),
                    self.min_check_interval_ms,
                    self.max_check_interval_ms,
                )
            })
            .clone();

        instance.initialize(config).await
    }

    pub fn get(&self, id: &ServerId) -> Option<Arc<ServerInstance>> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    /// Shuts the instance down and drops it from the pool. Absent ids are a
    /// no-op.
    pub async fn shutdown(&self, id: &ServerId) -> anyhow::Result<()> {
        let Some((_, instance)) = self.instances.remove(id) else {
            return Ok(());
        };
        instance.shutdown().await
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
