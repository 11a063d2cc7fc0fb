use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::pool::TaskPool;
use super::types::*;
use crate::balancer::service::LoadBalancer;
use crate::balancer::types::SelectionCriteria;
use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::runtime::clock::Clock;
use crate::runtime::ids::TaskId;
use crate::runtime::storage::{get_as, Storage};
use crate::server::pool::ServerPool;
use crate::stats::aggregator::StatsRegistry;
use crate::stats::types::CompletionRecord;

const SYNC_POLL: Duration = Duration::from_millis(100);
const SYNC_POLL_LIMIT: u32 = 300;

#[derive(Clone, Copy)]
enum TimerKind {
    Timeout,
    Cleanup,
}

/// Per-task actor. Operations serialize through the state mutex; at most one
/// timer (timeout or cleanup) is pending at any moment.
pub struct TaskInstance {
    id: TaskId,
    weak: Weak<TaskInstance>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Storage>,
    config: Arc<GatewayConfig>,
    balancer: Arc<LoadBalancer>,
    servers: Arc<ServerPool>,
    stats: Arc<StatsRegistry>,
    pool: Weak<TaskPool>,
    state: Mutex<InstanceState>,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

struct InstanceState {
    task: Option<Task>,
    retry_count: u32,
    completion_notified: bool,
}

impl TaskInstance {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: TaskId,
        clock: Arc<dyn Clock>,
        store: Arc<dyn Storage>,
        config: Arc<GatewayConfig>,
        balancer: Arc<LoadBalancer>,
        servers: Arc<ServerPool>,
        stats: Arc<StatsRegistry>,
        pool: Weak<TaskPool>,
    ) -> Arc<Self> {
        // Recover whatever a previous incarnation persisted; a recovered
        // terminal task must not re-emit its completion event.
        let task: Option<Task> = get_as(store.as_ref(), "task");
        let retry_count = get_as(store.as_ref(), "retryCount").unwrap_or(0);
        let completion_notified = task
            .as_ref()
            .map(|task| task.status.is_terminal())
            .unwrap_or(false);

        Arc::new_cyclic(|weak| Self {
            id,
            weak: weak.clone(),
            clock,
            store,
            config,
            balancer,
            servers,
            stats,
            pool,
            state: Mutex::new(InstanceState {
                task,
                retry_count,
                completion_notified,
            }),
            timer: StdMutex::new(None),
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Creates the task and kicks off assignment. Calling it again returns
    /// the existing task unchanged.
    ///
    /// Synchronous requests poll the stored status until it turns terminal
    /// (100 ms cadence, 30 s bound); asynchronous requests return right
    /// after the assignment attempt.
    pub async fn create_task(&self, request: TaskRequest) -> Result<Task, ApiError> {
        request.validate()?;
        let is_async = request.is_async;

        let initial = {
            let mut state = self.state.lock().await;

            if let Some(existing) = &state.task {
                return Ok(existing.clone());
            }

            let now = self.clock.now_ms();
            state.task = Some(Task {
                id: self.id.clone(),
                status: TaskStatus::Pending,
                request,
                server_id: None,
                result: None,
                error: None,
                progress: 0,
                created_at: now,
                updated_at: now,
                attempts: Vec::new(),
            });
            state.retry_count = 0;
            state.completion_notified = false;
            self.persist(&state);
            tracing::info!("task {} created (PENDING)", self.id);

            self.arm_timer(self.config.task_timeout_ms, TimerKind::Timeout);

            if let Err(err) = self.assign_and_execute(&mut state).await {
                let now = self.clock.now_ms();
                {
                    let task = state.task.as_mut().expect("task created above");
                    task.status = TaskStatus::Failed;
                    task.error = Some(err.to_string());
                    task.updated_at = now;
                }
                tracing::warn!("task {} failed at assignment: {}", self.id, err);
                self.persist(&state);
                self.notify_completion(&mut state);
                self.arm_timer(self.config.cleanup_delay_ms, TimerKind::Cleanup);
            }

            state.task.clone().expect("task created above")
        };

        if is_async || initial.status.is_terminal() {
            return Ok(initial);
        }
        self.wait_for_terminal().await
    }

    /// Snapshot of the stored task.
    pub async fn get_status(&self) -> Result<Task, ApiError> {
        let state = self.state.lock().await;
        state
            .task
            .clone()
            .ok_or_else(|| ApiError::NotFound(format!("task {}", self.id)))
    }

    /// Applies a lifecycle update (worker callback or synchronous result).
    /// Only a PROCESSING task accepts updates; a terminal update emits the
    /// completion event and arms the cleanup timer.
    pub async fn update_task(&self, update: TaskUpdate) -> Result<Task, ApiError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();

        let snapshot = {
            let task = state
                .task
                .as_mut()
                .ok_or_else(|| ApiError::NotFound(format!("task {}", self.id)))?;

            if task.status != TaskStatus::Processing {
                return Err(ApiError::IllegalTransition(format!(
                    "cannot update task in status {}",
                    task.status.as_str()
                )));
            }
            if update.status == TaskStatus::Cancelled {
                return Err(ApiError::IllegalTransition(
                    "cancellation must use the cancel operation".to_string(),
                ));
            }

            tracing::info!(
                "task {} {} -> {}",
                self.id,
                task.status.as_str(),
                update.status.as_str()
            );

            task.status = update.status;
            if let Some(result) = update.result {
                task.result = Some(result);
            }
            if let Some(progress) = update.progress {
                task.progress = progress.min(100);
            }
            if let Some(error) = update.error {
                task.error = Some(error);
            }
            task.updated_at = now;
            task.clone()
        };

        self.persist(&state);

        if snapshot.status.is_terminal() {
            self.notify_completion(&mut state);
            self.arm_timer(self.config.cleanup_delay_ms, TimerKind::Cleanup);
        }

        Ok(snapshot)
    }

    /// Re-dispatches a FAILED or TIMEOUT task. Returns false when the task
    /// does not exist, the retry ceiling is reached, the status does not
    /// allow it, or assignment fails.
    pub async fn retry(&self) -> bool {
        let mut state = self.state.lock().await;
        self.retry_locked(&mut state).await
    }

    async fn retry_locked(&self, state: &mut InstanceState) -> bool {
        let now = self.clock.now_ms();

        {
            let Some(task) = state.task.as_ref() else {
                return false;
            };
            if state.retry_count >= self.config.max_retries {
                tracing::debug!(
                    "task {} retry refused: ceiling of {} reached",
                    self.id,
                    self.config.max_retries
                );
                return false;
            }
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Timeout) {
                return false;
            }
        }

        state.retry_count += 1;
        state.completion_notified = false;
        {
            let retry_count = state.retry_count;
            let task = state.task.as_mut().expect("checked above");
            task.attempts.push(TaskAttempt {
                attempt: retry_count,
                started_at: now,
                previous_status: task.status,
                previous_error: task.error.clone(),
            });
            task.status = TaskStatus::Pending;
            task.error = None;
            task.updated_at = now;
        }

        tracing::info!(
            "task {} retry {}/{}",
            self.id,
            state.retry_count,
            self.config.max_retries
        );
        self.persist(state);
        self.arm_timer(self.config.task_timeout_ms, TimerKind::Timeout);

        match self.assign_and_execute(state).await {
            Ok(()) => true,
            Err(err) => {
                let now = self.clock.now_ms();
                {
                    let task = state.task.as_mut().expect("checked above");
                    task.status = TaskStatus::Failed;
                    task.error = Some(err.to_string());
                    task.updated_at = now;
                }
                tracing::warn!("task {} retry failed at assignment: {}", self.id, err);
                self.persist(state);
                self.notify_completion(state);
                self.arm_timer(self.config.cleanup_delay_ms, TimerKind::Cleanup);
                false
            }
        }
    }

    /// Cancels a non-terminal task.
    pub async fn cancel(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();

        {
            let task = state
                .task
                .as_mut()
                .ok_or_else(|| ApiError::NotFound(format!("task {}", self.id)))?;

            if task.status.is_terminal() {
                return Err(ApiError::IllegalTransition(format!(
                    "cannot cancel task in status {}",
                    task.status.as_str()
                )));
            }

            tracing::info!("task {} {} -> CANCELLED", self.id, task.status.as_str());
            task.status = TaskStatus::Cancelled;
            task.updated_at = now;
        }

        self.persist(&state);
        self.notify_completion(&mut state);
        self.arm_timer(self.config.cleanup_delay_ms, TimerKind::Cleanup);
        Ok(())
    }

    /// Picks a server, marks the task PROCESSING, and spawns the dispatch.
    /// The backend call is deliberately not awaited here: results come back
    /// through `update_task`, so no actor ever awaits a call into itself.
    async fn assign_and_execute(&self, state: &mut InstanceState) -> Result<(), ApiError> {
        let criteria = {
            let task = state.task.as_ref().expect("assignment without a task");
            SelectionCriteria {
                task_type: Some(task.request.task_type.clone()),
                priority: Some(task.request.priority),
                required_capabilities: task.request.capabilities.clone(),
            }
        };

        let server_id = self
            .balancer
            .select_server(&criteria)
            .await
            .ok_or(ApiError::NoAvailableServers)?;

        let now = self.clock.now_ms();
        let request = {
            let task = state.task.as_mut().expect("assignment without a task");
            task.server_id = Some(server_id.clone());
            task.status = TaskStatus::Processing;
            task.updated_at = now;
            task.request.clone()
        };
        self.persist(state);
        tracing::info!("task {} assigned to server {} (PROCESSING)", self.id, server_id);

        {
            let stats = self.stats.clone();
            let task_id = self.id.clone();
            let started_on = server_id.clone();
            tokio::spawn(async move {
                stats
                    .today()
                    .record_task_start(task_id, started_on)
                    .await;
            });
        }

        let servers = self.servers.clone();
        let instance = self.weak.upgrade();
        let callback_url = self.config.callback_url(&self.id);
        let task_id = self.id.clone();
        let is_async = request.is_async;

        tokio::spawn(async move {
            let outcome = match servers.get(&server_id) {
                Some(server) => server
                    .execute_task(&task_id, &request, &callback_url)
                    .await
                    .map(|_| ()),
                None => Err(ApiError::ServerUnavailable(server_id.0.clone())),
            };

            let Err(err) = outcome else {
                return;
            };

            if is_async {
                // Asynchronous path: the task stays PROCESSING until the
                // worker calls back or the timeout fires.
                tracing::warn!(
                    "async dispatch of task {} failed, awaiting callback or timeout: {}",
                    task_id,
                    err
                );
                return;
            }

            let Some(instance) = instance else {
                return;
            };
            let update = TaskUpdate {
                status: TaskStatus::Failed,
                result: None,
                progress: None,
                error: Some(err.to_string()),
            };
            if let Err(update_err) = instance.update_task(update).await {
                tracing::debug!(
                    "dispatch failure for task {} not recorded: {}",
                    task_id,
                    update_err
                );
            }
        });

        Ok(())
    }

    /// Synchronous-create wait loop: read-only polls of our own stored
    /// status, with a forced TIMEOUT once the bound elapses.
    async fn wait_for_terminal(&self) -> Result<Task, ApiError> {
        for _ in 0..SYNC_POLL_LIMIT {
            {
                let state = self.state.lock().await;
                match &state.task {
                    Some(task) if task.status.is_terminal() => return Ok(task.clone()),
                    Some(_) => {}
                    None => {
                        return Err(ApiError::NotFound(format!("task {}", self.id)));
                    }
                }
            }
            tokio::time::sleep(SYNC_POLL).await;
        }

        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();

        let snapshot = {
            let task = state
                .task
                .as_mut()
                .ok_or_else(|| ApiError::NotFound(format!("task {}", self.id)))?;
            if !task.status.is_terminal() {
                tracing::warn!("task {} synchronous wait expired, forcing TIMEOUT", self.id);
                task.status = TaskStatus::Timeout;
                task.error = Some("synchronous wait timed out".to_string());
                task.updated_at = now;
            }
            task.clone()
        };

        if snapshot.status == TaskStatus::Timeout {
            self.persist(&state);
            self.notify_completion(&mut state);
            self.arm_timer(self.config.cleanup_delay_ms, TimerKind::Cleanup);
        }
        Ok(snapshot)
    }

    /// Timeout-timer body. Only a task still PROCESSING past its deadline
    /// (measured from creation) transitions; a successful retry suppresses
    /// the completion event, a failed one finalizes the TIMEOUT.
    pub(crate) async fn handle_timeout_fired(&self) {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();

        {
            let Some(task) = state.task.as_mut() else {
                return;
            };
            if task.status != TaskStatus::Processing {
                return;
            }
            if now.saturating_sub(task.created_at) < self.config.task_timeout_ms {
                return;
            }

            tracing::warn!("task {} timed out (PROCESSING -> TIMEOUT)", self.id);
            task.status = TaskStatus::Timeout;
            task.error = Some("Task timed out".to_string());
            task.updated_at = now;
        }
        self.persist(&state);

        let retried = self.retry_locked(&mut state).await;
        if !retried {
            self.notify_completion(&mut state);
            self.arm_timer(self.config.cleanup_delay_ms, TimerKind::Cleanup);
        }
    }

    /// Cleanup-timer body: purge a terminal task once the retention window
    /// has elapsed.
    pub(crate) async fn handle_cleanup_fired(&self) {
        let mut state = self.state.lock().await;
        let now = self.clock.now_ms();

        let purge = match &state.task {
            Some(task) => {
                task.status.is_terminal()
                    && now.saturating_sub(task.updated_at) >= self.config.cleanup_delay_ms
            }
            None => false,
        };
        if !purge {
            return;
        }

        tracing::info!("task {} retention elapsed, purging", self.id);
        state.task = None;
        if let Err(err) = self.store.clear() {
            tracing::warn!("failed to clear storage for task {}: {}", self.id, err);
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.remove(&self.id);
        }
    }

    /// Emits the completion event exactly once per final terminal
    /// transition. `retry` resets the guard so a retried task can complete
    /// again.
    fn notify_completion(&self, state: &mut InstanceState) {
        if state.completion_notified {
            return;
        }
        let Some(task) = &state.task else {
            return;
        };
        state.completion_notified = true;

        let record = CompletionRecord {
            task_id: self.id.clone(),
            server_id: task.server_id.clone(),
            success: task.status == TaskStatus::Completed,
            duration_ms: task.updated_at.saturating_sub(task.created_at),
            retries: state.retry_count,
        };

        let stats = self.stats.clone();
        tokio::spawn(async move {
            stats.today().record_task_complete(record).await;
        });
    }

    /// Arms the actor's single pending timer, superseding any prior one.
    fn arm_timer(&self, delay_ms: u64, kind: TimerKind) {
        let Some(instance) = self.weak.upgrade() else {
            return;
        };

        let mut timer = self.timer.lock().unwrap();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            // This timer has fired; drop its handle so the handler's own
            // re-arming does not abort the running task.
            let _ = instance.timer.lock().unwrap().take();
            match kind {
                TimerKind::Timeout => instance.handle_timeout_fired().await,
                TimerKind::Cleanup => instance.handle_cleanup_fired().await,
            }
        }));
    }

    fn persist(&self, state: &InstanceState) {
        let entries = vec![
            ("task".to_string(), json!(state.task)),
            ("retryCount".to_string(), json!(state.retry_count)),
            (
                "createdAt".to_string(),
                json!(state.task.as_ref().map(|task| task.created_at)),
            ),
        ];
        if let Err(err) = self.store.put_many(entries) {
            tracing::warn!("failed to persist task {} state: {}", self.id, err);
        }
    }

    #[cfg(test)]
    pub(crate) async fn retry_count(&self) -> u32 {
        self.state.lock().await.retry_count
    }
}
