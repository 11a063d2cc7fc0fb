use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::types::*;
use crate::balancer::service::LoadBalancer;
use crate::balancer::types::ServerMetricsUpdate;
use crate::error::ApiError;
use crate::registry::service::ServerRegistry;
use crate::runtime::clock::Clock;
use crate::runtime::ids::{ServerId, TaskId};
use crate::runtime::storage::Storage;
use crate::task::pool::TaskPool;
use crate::task::types::{TaskRequest, TaskStatus, TaskUpdate};

const PREDICT_TIMEOUT: Duration = Duration::from_millis(30_000);
const HEALTH_TIMEOUT: Duration = Duration::from_millis(5_000);
const INITIAL_CHECK_INTERVAL_MS: u64 = 30_000;
const OFFLINE_FAILURE_THRESHOLD: u32 = 3;
const RECOVERY_SUCCESS_THRESHOLD: u32 = 3;
const HEALTH_SCORE_REWARD: u32 = 5;
const HEALTH_SCORE_PENALTY: u32 = 10;
const MAX_IDLE_MS: u64 = 3_600_000;
const DRAIN_POLL: Duration = Duration::from_millis(1_000);
const DRAIN_POLL_LIMIT: u64 = 30;

/// Per-server actor: runtime state machine, health loop, dispatch path.
pub struct ServerInstance {
    id: ServerId,
    weak: Weak<ServerInstance>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Storage>,
    http: reqwest::Client,
    balancer: Arc<LoadBalancer>,
    registry: Arc<OnceLock<Arc<ServerRegistry>>>,
    tasks: Arc<OnceLock<Arc<TaskPool>>>,
    min_check_interval_ms: u64,
    max_check_interval_ms: u64,
    state: Mutex<RuntimeState>,
    check_timer: StdMutex<Option<JoinHandle<()>>>,
}

struct RuntimeState {
    config: ServerConfig,
    status: ServerStatus,
    health_score: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    check_interval_ms: u64,
    last_activity: u64,
    active_tasks: HashSet<TaskId>,
    metrics: CumulativeMetrics,
}

#[allow(clippy::too_many_arguments)]
impl ServerInstance {
    pub(super) fn new(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Storage>,
        http: reqwest::Client,
        balancer: Arc<LoadBalancer>,
        registry: Arc<OnceLock<Arc<ServerRegistry>>>,
        tasks: Arc<OnceLock<Arc<TaskPool>>>,
        min_check_interval_ms: u64,
        max_check_interval_ms: u64,
    ) -> Arc<Self> {
        let now = clock.now_ms();
        let id = config.id.clone();

        Arc::new_cyclic(|weak| Self {
            id,
            weak: weak.clone(),
            clock,
            store,
            http,
            balancer,
            registry,
            tasks,
            min_check_interval_ms,
            max_check_interval_ms,
            state: Mutex::new(RuntimeState {
                config,
                status: ServerStatus::Initializing,
                health_score: 100,
                consecutive_failures: 0,
                consecutive_successes: 0,
                check_interval_ms: INITIAL_CHECK_INTERVAL_MS,
                last_activity: now,
                active_tasks: HashSet::new(),
                metrics: CumulativeMetrics::default(),
            }),
            check_timer: StdMutex::new(None),
        })
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Brings the instance online: stores the configuration, schedules the
    /// first health check, and registers a metric snapshot with the
    /// balancer. Re-running it (repeated registration) resets the state
    /// machine.
    pub async fn initialize(&self, config: ServerConfig) -> Result<(), ApiError> {
        config.validate()?;

        let interval = {
            let mut state = self.state.lock().await;
            state.config = config;
            state.status = ServerStatus::Online;
            state.health_score = 100;
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
            state.check_interval_ms =
                INITIAL_CHECK_INTERVAL_MS.clamp(self.min_check_interval_ms, self.max_check_interval_ms);
            state.last_activity = self.clock.now_ms();

            tracing::info!("server {} initialized (status=online)", self.id);
            self.persist(&state);
            self.notify_balancer(metrics_update(&state, false));
            state.check_interval_ms
        };

        self.schedule_check(interval);
        Ok(())
    }

    /// Forwards one task to the backend worker.
    ///
    /// Preconditions are checked under the state lock; the HTTP call itself
    /// runs outside it so concurrent dispatches can fill the configured
    /// capacity. Returns the backend's JSON result on the synchronous path,
    /// `None` on the asynchronous (202) path.
    pub async fn execute_task(
        &self,
        task_id: &TaskId,
        request: &TaskRequest,
        callback_url: &str,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let (predict_url, api_key) = {
            let mut state = self.state.lock().await;

            if state.status != ServerStatus::Online {
                return Err(ApiError::ServerUnavailable(self.id.0.clone()));
            }
            if state.active_tasks.len() as u32 >= state.config.max_concurrent {
                return Err(ApiError::AtCapacity(self.id.0.clone()));
            }

            state.active_tasks.insert(task_id.clone());
            state.last_activity = self.clock.now_ms();
            (
                state.config.endpoints.predict.clone(),
                state.config.api_key.clone(),
            )
        };

        tracing::debug!("server {} dispatching task {}", self.id, task_id);

        let started = self.clock.now_ms();
        let outcome = self
            .dispatch(task_id, request, callback_url, &predict_url, api_key.as_deref())
            .await;
        let duration_ms = self.clock.now_ms().saturating_sub(started);

        let update = {
            let mut state = self.state.lock().await;
            state.active_tasks.remove(task_id);
            state.last_activity = self.clock.now_ms();
            state.metrics.record(outcome.is_ok(), duration_ms);
            self.persist(&state);
            metrics_update(&state, true)
        };
        self.notify_balancer(update);

        if let Err(err) = &outcome {
            tracing::warn!("server {} failed task {}: {}", self.id, task_id, err);
        }
        outcome
    }

    async fn dispatch(
        &self,
        task_id: &TaskId,
        request: &TaskRequest,
        callback_url: &str,
        predict_url: &str,
        api_key: Option<&str>,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let body = PredictRequest {
            task_id: task_id.0.clone(),
            request: serde_json::to_value(request)
                .map_err(|err| ApiError::Internal(err.into()))?,
            callback_url: callback_url.to_string(),
        };

        let mut builder = self
            .http
            .post(predict_url)
            .json(&body)
            .timeout(PREDICT_TIMEOUT);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ApiError::Backend(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::Backend(format!(
                "predict returned {}",
                response.status()
            )));
        }

        if request.is_async {
            // 202-style acceptance; the worker reports back through the
            // callback URL.
            return Ok(None);
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|err| ApiError::Backend(format!("invalid predict response: {}", err)))?;

        // Synchronous path: the result is delivered through the same
        // update channel callbacks use, so completion has a single writer.
        if let Some(tasks) = self.tasks.get() {
            if let Err(err) = tasks
                .update(
                    task_id,
                    TaskUpdate {
                        status: TaskStatus::Completed,
                        result: Some(result.clone()),
                        progress: Some(100),
                        error: None,
                    },
                )
                .await
            {
                tracing::warn!(
                    "could not deliver synchronous result for task {}: {}",
                    task_id,
                    err
                );
            }
        }

        Ok(Some(result))
    }

    /// Probes the worker's health endpoint and folds the outcome into the
    /// adaptive state machine. Probe failures are reflected in state, never
    /// raised.
    pub async fn perform_health_check(&self) -> HealthStatus {
        let health_url = {
            let state = self.state.lock().await;
            state.config.endpoints.health.clone()
        };

        match self.probe(&health_url).await {
            Ok(()) => self.record_check_success().await,
            Err(reason) => self.record_check_failure(&reason).await,
        }

        let state = self.state.lock().await;
        HealthStatus {
            healthy: state.status == ServerStatus::Online,
            status: state.status,
            health_score: state.health_score,
            check_interval_ms: state.check_interval_ms,
        }
    }

    /// A probe passes only if the endpoint answers 2xx *and* identifies
    /// itself as the server we registered.
    async fn probe(&self, health_url: &str) -> Result<(), String> {
        let response = self
            .http
            .get(health_url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        if !response.status().is_success() {
            return Err(format!("health returned {}", response.status()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| format!("invalid health response: {}", err))?;

        match body.get("serverId").and_then(|value| value.as_str()) {
            Some(peer) if peer == self.id.0 => Ok(()),
            Some(peer) => Err(format!(
                "identity mismatch: peer reports '{}', registered as '{}'",
                peer, self.id
            )),
            None => Err("health response carries no serverId".to_string()),
        }
    }

    async fn record_check_success(&self) {
        let update = {
            let mut state = self.state.lock().await;
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            state.health_score = (state.health_score + HEALTH_SCORE_REWARD).min(100);

            if matches!(state.status, ServerStatus::Degraded | ServerStatus::Offline)
                && state.consecutive_successes >= RECOVERY_SUCCESS_THRESHOLD
            {
                tracing::info!(
                    "server {} recovered ({} -> online)",
                    self.id,
                    state.status.as_str()
                );
                state.status = ServerStatus::Online;
                self.mirror_status(state.status);
            }

            state.check_interval_ms = ((state.check_interval_ms as f64 * 1.2) as u64)
                .min(self.max_check_interval_ms);

            self.persist(&state);
            metrics_update(&state, false)
        };

        self.notify_balancer(update);
        self.heartbeat_registry();
    }

    async fn record_check_failure(&self, reason: &str) {
        let update = {
            let mut state = self.state.lock().await;
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            state.health_score = state.health_score.saturating_sub(HEALTH_SCORE_PENALTY);

            tracing::warn!(
                "server {} health check failed ({} consecutive): {}",
                self.id,
                state.consecutive_failures,
                reason
            );

            if state.status != ServerStatus::Maintenance {
                let next = if state.consecutive_failures >= OFFLINE_FAILURE_THRESHOLD {
                    ServerStatus::Offline
                } else if state.status == ServerStatus::Online {
                    ServerStatus::Degraded
                } else {
                    state.status
                };
                if state.status != next {
                    tracing::warn!(
                        "server {} {} -> {}",
                        self.id,
                        state.status.as_str(),
                        next.as_str()
                    );
                    state.status = next;
                    self.mirror_status(next);
                }
            }

            state.check_interval_ms = ((state.check_interval_ms as f64 / 1.5) as u64)
                .max(self.min_check_interval_ms);

            self.persist(&state);
            metrics_update(&state, false)
        };

        self.notify_balancer(update);
    }

    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let state = self.state.lock().await;
        MetricsSnapshot {
            server_id: self.id.clone(),
            status: state.status,
            healthy: state.status == ServerStatus::Online,
            health_score: state.health_score,
            tasks_processed: state.metrics.tasks_processed,
            successes: state.metrics.successes,
            failures: state.metrics.failures,
            success_rate: state.metrics.success_rate(),
            average_response_time_ms: state.metrics.average_response_time_ms(),
            active_tasks: state.active_tasks.len() as u32,
            max_concurrent: state.config.max_concurrent,
            capabilities: state.config.capabilities.clone(),
        }
    }

    pub async fn set_maintenance(&self, enabled: bool) {
        let update = {
            let mut state = self.state.lock().await;
            let next = if enabled {
                ServerStatus::Maintenance
            } else {
                ServerStatus::Online
            };
            tracing::info!(
                "server {} {} -> {}",
                self.id,
                state.status.as_str(),
                next.as_str()
            );
            state.status = next;
            self.persist(&state);
            self.mirror_status(next);
            if enabled {
                None
            } else {
                Some(metrics_update(&state, false))
            }
        };

        match update {
            Some(update) => self.notify_balancer(update),
            None => {
                let balancer = self.balancer.clone();
                let id = self.id.clone();
                tokio::spawn(async move {
                    balancer.mark_server_unhealthy(&id).await;
                });
            }
        }
    }

    /// Takes the server offline: cancels the health loop, waits up to 30
    /// seconds for active dispatches to drain, tells the balancer, and
    /// erases storage.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().await;
            tracing::info!("server {} shutting down ({} active tasks)", self.id, state.active_tasks.len());
            state.status = ServerStatus::Offline;
            self.persist(&state);
        }

        if let Some(handle) = self.check_timer.lock().unwrap().take() {
            handle.abort();
        }

        for _ in 0..DRAIN_POLL_LIMIT {
            if self.state.lock().await.active_tasks.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let remaining = self.state.lock().await.active_tasks.len();
        if remaining > 0 {
            tracing::warn!(
                "server {} shutting down with {} tasks still active",
                self.id,
                remaining
            );
        }

        self.balancer.mark_server_unhealthy(&self.id).await;
        self.store.clear()?;
        Ok(())
    }

    /// Arms the single pending health timer, superseding any prior one.
    fn schedule_check(&self, delay_ms: u64) {
        let Some(instance) = self.weak.upgrade() else {
            return;
        };

        let mut timer = self.check_timer.lock().unwrap();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            // This timer has fired; drop its handle so re-arming (or an
            // idle shutdown) does not abort the running cycle.
            let _ = instance.check_timer.lock().unwrap().take();
            instance.run_check_cycle().await;
        }));
    }

    /// Timer body: idle cleanup first, otherwise probe and re-arm.
    async fn run_check_cycle(self: Arc<Self>) {
        let idle = {
            let state = self.state.lock().await;
            state.active_tasks.is_empty()
                && self.clock.now_ms().saturating_sub(state.last_activity) > MAX_IDLE_MS
        };

        if idle {
            tracing::info!("server {} idle too long, shutting down", self.id);
            if let Err(err) = self.shutdown().await {
                tracing::error!("idle shutdown of server {} failed: {}", self.id, err);
            }
            return;
        }

        self.perform_health_check().await;

        let next = self.state.lock().await.check_interval_ms;
        self.schedule_check(next);
    }

    fn persist(&self, state: &RuntimeState) {
        let entries = vec![
            ("config".to_string(), json!(state.config)),
            ("status".to_string(), json!(state.status)),
            ("healthScore".to_string(), json!(state.health_score)),
            ("checkInterval".to_string(), json!(state.check_interval_ms)),
            ("lastActivityTime".to_string(), json!(state.last_activity)),
            ("metrics".to_string(), json!(state.metrics)),
        ];
        if let Err(err) = self.store.put_many(entries) {
            tracing::warn!("failed to persist server {} state: {}", self.id, err);
        }
    }

    fn notify_balancer(&self, update: ServerMetricsUpdate) {
        let balancer = self.balancer.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            balancer.update_server_metrics(&id, update).await;
        });
    }

    fn heartbeat_registry(&self) {
        let Some(registry) = self.registry.get() else {
            return;
        };
        let registry = registry.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(err) = registry.update_heartbeat(&id).await {
                tracing::debug!("heartbeat for {} not recorded: {}", id, err);
            }
        });
    }

    /// Mirrors a runtime status transition into the registry's fleet view.
    fn mirror_status(&self, status: ServerStatus) {
        let Some(registry) = self.registry.get() else {
            return;
        };
        let registry = registry.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            registry.update_server_status(&id, status).await;
        });
    }

    #[cfg(test)]
    pub(crate) async fn active_task_count(&self) -> usize {
        self.state.lock().await.active_tasks.len()
    }

    #[cfg(test)]
    pub(crate) async fn status(&self) -> ServerStatus {
        self.state.lock().await.status
    }
}

fn metrics_update(state: &RuntimeState, task_completed: bool) -> ServerMetricsUpdate {
    ServerMetricsUpdate {
        healthy: state.status == ServerStatus::Online,
        active_tasks: state.active_tasks.len() as u32,
        max_concurrent: state.config.max_concurrent,
        capabilities: state.config.capabilities.clone(),
        success_rate: state.metrics.success_rate(),
        average_response_time_ms: state.metrics.average_response_time_ms(),
        task_completed,
    }
}
