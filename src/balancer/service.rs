use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;

use super::types::*;
use crate::registry::service::ServerRegistry;
use crate::registry::types::ServerFilter;
use crate::runtime::clock::Clock;
use crate::runtime::ids::ServerId;
use crate::runtime::storage::{get_as, Storage};
use crate::server::types::ServerStatus;

const REBALANCE_INTERVAL: Duration = Duration::from_millis(30_000);

/// The "global" load-balancer actor. Holds the cached fleet view and the
/// selection cursor; all operations serialize through the state mutex.
pub struct LoadBalancer {
    clock: Arc<dyn Clock>,
    store: Arc<dyn Storage>,
    registry: OnceLock<Arc<ServerRegistry>>,
    state: Mutex<BalancerState>,
}

struct BalancerState {
    algorithm: Algorithm,
    weights: HashMap<ServerId, u32>,
    loads: HashMap<ServerId, u32>,
    metrics: HashMap<ServerId, CachedMetrics>,
    healthy: HashSet<ServerId>,
    cursor: usize,
}

impl LoadBalancer {
    pub fn new(clock: Arc<dyn Clock>, store: Arc<dyn Storage>) -> Arc<Self> {
        let algorithm = get_as(store.as_ref(), "algorithm").unwrap_or_default();

        Arc::new(Self {
            clock,
            store,
            registry: OnceLock::new(),
            state: Mutex::new(BalancerState {
                algorithm,
                weights: HashMap::new(),
                loads: HashMap::new(),
                metrics: HashMap::new(),
                healthy: HashSet::new(),
                cursor: 0,
            }),
        })
    }

    /// Installs the registry back-edge. Called once during wiring; selection
    /// before binding works off the current cached healthy set.
    pub fn bind_registry(&self, registry: Arc<ServerRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Spawns the periodic rebalance loop.
    pub fn start(self: &Arc<Self>) {
        let balancer = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REBALANCE_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(err) = balancer.rebalance().await {
                    tracing::warn!("scheduled rebalance failed: {}", err);
                }
            }
        });
    }

    /// Picks a server for the given criteria, or `None` when nothing
    /// qualifies. Never fails: "no server" is an answer, not an error.
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> Option<ServerId> {
        self.refresh_healthy().await;

        let mut state = self.state.lock().await;

        let mut candidates: Vec<ServerId> = state
            .healthy
            .iter()
            .filter(|id| {
                let Some(metrics) = state.metrics.get(*id) else {
                    return false;
                };
                if metrics.active_tasks >= metrics.max_concurrent {
                    return false;
                }
                criteria
                    .required_capabilities
                    .iter()
                    .all(|cap| metrics.capabilities.contains(cap))
            })
            .cloned()
            .collect();

        if candidates.is_empty() {
            tracing::debug!(
                "no candidate for type={:?} capabilities={:?}",
                criteria.task_type,
                criteria.required_capabilities
            );
            return None;
        }

        // Deterministic iteration order so cursor arithmetic and tie-breaks
        // behave the same on every node.
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let chosen = pick(&mut state, &candidates)?;
        *state.loads.entry(chosen.clone()).or_insert(0) += 1;

        tracing::debug!(
            "selected server {} via {:?} (load now {})",
            chosen,
            state.algorithm,
            state.loads[&chosen]
        );

        self.persist_async(&state);
        Some(chosen)
    }

    /// Merges a metric snapshot pushed by a server instance.
    pub async fn update_server_metrics(&self, server_id: &ServerId, update: ServerMetricsUpdate) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        let weight = compute_weight(update.success_rate, update.average_response_time_ms);
        state.weights.insert(server_id.clone(), weight);

        state.metrics.insert(
            server_id.clone(),
            CachedMetrics {
                healthy: update.healthy,
                active_tasks: update.active_tasks,
                max_concurrent: update.max_concurrent,
                capabilities: update.capabilities.clone(),
                success_rate: update.success_rate,
                average_response_time_ms: Some(update.average_response_time_ms),
                last_update: now,
            },
        );

        if update.healthy {
            state.healthy.insert(server_id.clone());
        } else {
            state.healthy.remove(server_id);
        }

        if update.task_completed {
            let load = state.loads.entry(server_id.clone()).or_insert(0);
            *load = load.saturating_sub(1);
        }

        self.persist_async(&state);
    }

    /// Drops a server from the healthy set and zeroes its weight.
    pub async fn mark_server_unhealthy(&self, server_id: &ServerId) {
        let mut state = self.state.lock().await;
        state.healthy.remove(server_id);
        state.weights.insert(server_id.clone(), 0);
        if let Some(metrics) = state.metrics.get_mut(server_id) {
            metrics.healthy = false;
        }
        tracing::info!("server {} marked unhealthy", server_id);
        self.persist_async(&state);
    }

    /// Re-derives the cached fleet view from the registry: resets the healthy
    /// set, seeds entries for newly-seen servers, prunes departed ones.
    pub async fn rebalance(&self) -> anyhow::Result<()> {
        let Some(registry) = self.registry.get() else {
            tracing::debug!("rebalance skipped: registry not bound yet");
            return Ok(());
        };

        let online = registry
            .get_available_servers(&ServerFilter {
                status: Some(ServerStatus::Online),
                ..Default::default()
            })
            .await;

        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        let present: HashSet<ServerId> = online.iter().map(|info| info.config.id.clone()).collect();

        state.healthy = present.clone();

        for info in &online {
            let id = info.config.id.clone();
            state.metrics.entry(id.clone()).or_insert(CachedMetrics {
                healthy: true,
                active_tasks: 0,
                max_concurrent: info.config.max_concurrent,
                capabilities: info.config.capabilities.clone(),
                success_rate: 1.0,
                average_response_time_ms: None,
                last_update: now,
            });
            state.weights.entry(id).or_insert(1);
        }

        state.metrics.retain(|id, _| present.contains(id));
        state.weights.retain(|id, _| present.contains(id));
        state.loads.retain(|id, _| present.contains(id));

        tracing::debug!("rebalanced: {} healthy servers", state.healthy.len());
        self.persist_async(&state);
        Ok(())
    }

    pub async fn set_algorithm(&self, algorithm: Algorithm) {
        let mut state = self.state.lock().await;
        state.algorithm = algorithm;
        tracing::info!("load balancing algorithm set to {:?}", algorithm);
        self.persist_async(&state);
    }

    pub async fn status(&self) -> BalancerStatus {
        let state = self.state.lock().await;
        let mut healthy: Vec<ServerId> = state.healthy.iter().cloned().collect();
        healthy.sort_by(|a, b| a.0.cmp(&b.0));

        BalancerStatus {
            algorithm: state.algorithm,
            healthy_servers: healthy,
            server_loads: state
                .loads
                .iter()
                .map(|(id, load)| (id.0.clone(), *load))
                .collect(),
        }
    }

    async fn refresh_healthy(&self) {
        let Some(registry) = self.registry.get() else {
            return;
        };

        let online = registry
            .get_available_servers(&ServerFilter {
                status: Some(ServerStatus::Online),
                ..Default::default()
            })
            .await;

        let mut state = self.state.lock().await;
        state.healthy = online.iter().map(|info| info.config.id.clone()).collect();
    }

    /// Persists the cached view without blocking the caller.
    fn persist_async(&self, state: &BalancerState) {
        let entries = vec![
            ("algorithm".to_string(), json!(state.algorithm)),
            (
                "weights".to_string(),
                json!(state
                    .weights
                    .iter()
                    .map(|(id, weight)| (id.0.clone(), *weight))
                    .collect::<HashMap<String, u32>>()),
            ),
            (
                "healthyServers".to_string(),
                json!(state
                    .healthy
                    .iter()
                    .map(|id| id.0.clone())
                    .collect::<Vec<String>>()),
            ),
        ];

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.put_many(entries) {
                tracing::warn!("failed to persist balancer state: {}", err);
            }
        });
    }
}

/// Weight falls monotonically as success rate drops or response time rises.
fn compute_weight(success_rate: f64, average_response_time_ms: f64) -> u32 {
    let latency_bonus = (10.0 - average_response_time_ms / 1000.0).max(0.0);
    ((success_rate * 10.0 + latency_bonus) / 2.0).round() as u32
}

fn pick(state: &mut BalancerState, candidates: &[ServerId]) -> Option<ServerId> {
    match state.algorithm {
        Algorithm::RoundRobin => {
            let chosen = candidates[state.cursor % candidates.len()].clone();
            state.cursor = state.cursor.wrapping_add(1);
            Some(chosen)
        }
        Algorithm::WeightedRoundRobin => {
            let expanded: Vec<&ServerId> = candidates
                .iter()
                .filter(|id| state.weights.get(*id).copied().unwrap_or(1) > 0)
                .flat_map(|id| {
                    let weight = state.weights.get(id).copied().unwrap_or(1).max(1) as usize;
                    std::iter::repeat(id).take(weight)
                })
                .collect();
            if expanded.is_empty() {
                return None;
            }
            let chosen = (*expanded[state.cursor % expanded.len()]).clone();
            state.cursor = state.cursor.wrapping_add(1);
            Some(chosen)
        }
        Algorithm::LeastConnections => candidates
            .iter()
            .min_by_key(|id| state.loads.get(*id).copied().unwrap_or(0))
            .cloned(),
        Algorithm::ResponseTime => candidates
            .iter()
            .min_by(|a, b| {
                let time_a = rank_response_time(state, a);
                let time_b = rank_response_time(state, b);
                time_a
                    .partial_cmp(&time_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned(),
        Algorithm::Random => {
            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..candidates.len());
            Some(candidates[idx].clone())
        }
    }
}

/// Servers with no measurement yet rank behind every measured one.
fn rank_response_time(state: &BalancerState, id: &ServerId) -> (bool, f64) {
    match state
        .metrics
        .get(id)
        .and_then(|metrics| metrics.average_response_time_ms)
    {
        Some(avg) => (false, avg),
        None => (true, f64::MAX),
    }
}
