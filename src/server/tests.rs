//! Server Instance Tests
//!
//! Runs instances against stub backend workers served on ephemeral local
//! ports: dispatch paths (sync/async, capacity, failures), the adaptive
//! health state machine, maintenance, and shutdown.

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::pool::ServerPool;
use super::types::{ServerConfig, ServerEndpoints, ServerStatus};
use crate::balancer::service::LoadBalancer;
use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::registry::service::ServerRegistry;
use crate::registry::types::ServerFilter;
use crate::runtime::clock::ManualClock;
use crate::runtime::ids::{ServerId, TaskId};
use crate::runtime::storage::MemoryBackend;
use crate::task::types::TaskRequest;

const START: u64 = 1_704_533_400_000;

struct Fixture {
    clock: Arc<ManualClock>,
    backend: Arc<MemoryBackend>,
    balancer: Arc<LoadBalancer>,
    pool: Arc<ServerPool>,
    registry: Arc<ServerRegistry>,
}

fn fixture() -> Fixture {
    let config = Arc::new(GatewayConfig::for_tests());
    let clock = ManualClock::new(START);
    let backend = MemoryBackend::new();
    let balancer = LoadBalancer::new(clock.clone(), backend.namespace("balancer"));
    let pool = ServerPool::new(&config, clock.clone(), backend.clone(), balancer.clone());
    let registry = ServerRegistry::new(
        &config,
        clock.clone(),
        backend.namespace("registry"),
        balancer.clone(),
        pool.clone(),
    );
    balancer.bind_registry(registry.clone());
    pool.bind_registry(registry.clone());

    Fixture {
        clock,
        backend,
        balancer,
        pool,
        registry,
    }
}

/// Serves a stub worker on an ephemeral port; returns its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A well-behaved worker: identifies itself on /health, answers /predict
/// synchronously with a JSON result.
async fn serve_sync_worker(server_id: &str, result: Value) -> String {
    let id = server_id.to_string();
    serve(
        Router::new()
            .route(
                "/health",
                get(move || {
                    let id = id.clone();
                    async move { Json(json!({ "serverId": id })) }
                }),
            )
            .route(
                "/predict",
                post(move || {
                    let result = result.clone();
                    async move { Json(result) }
                }),
            ),
    )
    .await
}

/// A worker that accepts dispatches with 202 (asynchronous contract).
async fn serve_async_worker(server_id: &str) -> String {
    let id = server_id.to_string();
    serve(
        Router::new()
            .route(
                "/health",
                get(move || {
                    let id = id.clone();
                    async move { Json(json!({ "serverId": id })) }
                }),
            )
            .route(
                "/predict",
                post(|| async {
                    (StatusCode::ACCEPTED, Json(json!({ "status": "PROCESSING" })))
                }),
            ),
    )
    .await
}

/// A worker whose /predict stalls before answering. Used for concurrency
/// tests.
async fn serve_slow_worker(server_id: &str, delay: Duration) -> String {
    let id = server_id.to_string();
    serve(
        Router::new()
            .route(
                "/health",
                get(move || {
                    let id = id.clone();
                    async move { Json(json!({ "serverId": id })) }
                }),
            )
            .route(
                "/predict",
                post(move || async move {
                    tokio::time::sleep(delay).await;
                    Json(json!({ "ok": true }))
                }),
            ),
    )
    .await
}

/// A worker whose /health always fails.
async fn serve_unhealthy_worker() -> String {
    serve(Router::new().route(
        "/health",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    ))
    .await
}

fn worker_config(id: &str, base: &str, max_concurrent: u32) -> ServerConfig {
    ServerConfig {
        id: ServerId(id.to_string()),
        name: format!("worker {}", id),
        endpoints: ServerEndpoints {
            predict: format!("{}/predict", base),
            health: format!("{}/health", base),
            metrics: None,
        },
        api_key: None,
        max_concurrent,
        capabilities: HashSet::new(),
        groups: HashSet::new(),
        priority: 5,
    }
}

fn request(is_async: bool) -> TaskRequest {
    TaskRequest {
        task_type: "video-processing".to_string(),
        priority: 1,
        payload: json!({"frames": 10}),
        capabilities: vec![],
        is_async,
    }
}

#[tokio::test]
async fn sync_dispatch_returns_backend_result() {
    let fx = fixture();
    let base = serve_sync_worker("s1", json!({"output_url": "x"})).await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    let result = instance
        .execute_task(&TaskId("t1".to_string()), &request(false), "http://cb/t1")
        .await
        .unwrap();

    assert_eq!(result, Some(json!({"output_url": "x"})));
    assert_eq!(instance.active_task_count().await, 0);

    let metrics = instance.get_metrics().await;
    assert_eq!(metrics.tasks_processed, 1);
    assert_eq!(metrics.successes, 1);
    assert!((metrics.success_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn async_dispatch_returns_no_result() {
    let fx = fixture();
    let base = serve_async_worker("s1").await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    let result = instance
        .execute_task(&TaskId("t1".to_string()), &request(true), "http://cb/t1")
        .await
        .unwrap();

    assert_eq!(result, None);
}

#[tokio::test]
async fn dispatch_beyond_capacity_is_rejected() {
    let fx = fixture();
    let base = serve_slow_worker("s1", Duration::from_millis(300)).await;
    fx.pool
        .initialize(worker_config("s1", &base, 1))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();

    let first_task_id = TaskId("t1".to_string());
    let first_request = request(false);
    let first = instance.execute_task(&first_task_id, &first_request, "http://cb/t1");
    let second = async {
        // Let the first dispatch claim its slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        instance
            .execute_task(&TaskId("t2".to_string()), &request(false), "http://cb/t2")
            .await
    };

    let (first, second) = tokio::join!(first, second);
    assert!(first.is_ok());
    assert!(matches!(second, Err(ApiError::AtCapacity(_))));

    // The slot is released afterwards.
    assert_eq!(instance.active_task_count().await, 0);
}

#[tokio::test]
async fn dispatch_to_failing_backend_propagates_and_counts() {
    let fx = fixture();
    let base = serve(Router::new().route(
        "/predict",
        post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    ))
    .await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    let result = instance
        .execute_task(&TaskId("t1".to_string()), &request(false), "http://cb/t1")
        .await;

    assert!(matches!(result, Err(ApiError::Backend(_))));
    let metrics = instance.get_metrics().await;
    assert_eq!(metrics.failures, 1);
    assert_eq!(instance.active_task_count().await, 0);
}

#[tokio::test]
async fn dispatch_requires_online_status() {
    let fx = fixture();
    let base = serve_sync_worker("s1", json!({})).await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    instance.set_maintenance(true).await;

    let result = instance
        .execute_task(&TaskId("t1".to_string()), &request(false), "http://cb/t1")
        .await;
    assert!(matches!(result, Err(ApiError::ServerUnavailable(_))));
}

#[tokio::test]
async fn health_check_success_backs_off_and_rewards() {
    let fx = fixture();
    let base = serve_sync_worker("s1", json!({})).await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    let health = instance.perform_health_check().await;

    assert!(health.healthy);
    assert_eq!(health.status, ServerStatus::Online);
    assert_eq!(health.health_score, 100); // capped
    assert_eq!(health.check_interval_ms, 36_000); // 30s * 1.2
}

#[tokio::test]
async fn health_check_failure_degrades_then_offlines() {
    let fx = fixture();
    let base = serve_unhealthy_worker().await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();

    let first = instance.perform_health_check().await;
    assert_eq!(first.status, ServerStatus::Degraded);
    assert_eq!(first.health_score, 90);
    assert_eq!(first.check_interval_ms, 20_000); // 30s / 1.5

    let second = instance.perform_health_check().await;
    assert_eq!(second.status, ServerStatus::Degraded);

    let third = instance.perform_health_check().await;
    assert_eq!(third.status, ServerStatus::Offline);
    assert_eq!(third.health_score, 70);
}

#[tokio::test]
async fn health_check_rejects_identity_mismatch() {
    let fx = fixture();
    // The peer answers 2xx but identifies as a different server.
    let base = serve_sync_worker("impostor", json!({})).await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    let health = instance.perform_health_check().await;

    assert!(!health.healthy);
    assert_eq!(health.status, ServerStatus::Degraded);
}

#[tokio::test]
async fn health_score_saturates_at_zero_and_hundred() {
    let fx = fixture();
    let bad = serve_unhealthy_worker().await;
    fx.pool
        .initialize(worker_config("s1", &bad, 2))
        .await
        .unwrap();
    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();

    for _ in 0..15 {
        instance.perform_health_check().await;
    }
    let floor = instance.perform_health_check().await;
    assert_eq!(floor.health_score, 0);

    // Point the same instance at a healthy worker by re-initializing.
    let good = serve_sync_worker("s1", json!({})).await;
    fx.pool
        .initialize(worker_config("s1", &good, 2))
        .await
        .unwrap();
    let cap = instance.perform_health_check().await;
    assert_eq!(cap.health_score, 100);
}

#[tokio::test]
async fn degraded_server_recovers_after_three_consecutive_successes() {
    let fx = fixture();

    // A worker that fails twice, then answers healthily forever.
    let id = "s1".to_string();
    let failures = Arc::new(std::sync::atomic::AtomicU32::new(2));
    let failures_handle = failures.clone();
    let base = serve(Router::new().route(
        "/health",
        get(move || {
            let id = id.clone();
            let failures = failures_handle.clone();
            async move {
                if failures
                    .fetch_update(
                        std::sync::atomic::Ordering::SeqCst,
                        std::sync::atomic::Ordering::SeqCst,
                        |n| if n > 0 { Some(n - 1) } else { None },
                    )
                    .is_ok()
                {
                    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})))
                } else {
                    (StatusCode::OK, Json(json!({ "serverId": id })))
                }
            }
        }),
    ))
    .await;

    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();
    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();

    instance.perform_health_check().await; // fail 1 -> degraded
    instance.perform_health_check().await; // fail 2 -> degraded
    assert_eq!(instance.status().await, ServerStatus::Degraded);

    instance.perform_health_check().await; // success 1
    instance.perform_health_check().await; // success 2
    assert_eq!(instance.status().await, ServerStatus::Degraded);
    instance.perform_health_check().await; // success 3 -> online
    assert_eq!(instance.status().await, ServerStatus::Online);
}

#[tokio::test]
async fn failing_server_drops_out_of_listing_and_selection() {
    let fx = fixture();
    let base = serve_unhealthy_worker().await;
    fx.registry
        .register_server(worker_config("s2", &base, 2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let instance = fx.pool.get(&ServerId("s2".to_string())).unwrap();
    for _ in 0..3 {
        instance.perform_health_check().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The registry mirrors the offline transition.
    let listed = fx
        .registry
        .get_available_servers(&ServerFilter::default())
        .await;
    assert_eq!(listed[0].status, ServerStatus::Offline);

    // And the balancer no longer selects it.
    let chosen = fx
        .balancer
        .select_server(&crate::balancer::types::SelectionCriteria::default())
        .await;
    assert!(chosen.is_none());
}

#[tokio::test]
async fn successful_checks_heartbeat_the_registry() {
    let fx = fixture();
    let base = serve_sync_worker("s1", json!({})).await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();
    fx.registry
        .register_server(worker_config("s1", &base, 2))
        .await
        .unwrap();

    // Age the heartbeat, then let a successful check refresh it.
    fx.clock.advance(200_000);
    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    instance.perform_health_check().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let listed = fx
        .registry
        .get_available_servers(&ServerFilter::default())
        .await;
    assert!(listed[0].time_since_last_heartbeat_ms < 200_000);
}

#[tokio::test]
async fn maintenance_flips_status_and_back() {
    let fx = fixture();
    let base = serve_sync_worker("s1", json!({})).await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();
    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();

    instance.set_maintenance(true).await;
    assert_eq!(instance.status().await, ServerStatus::Maintenance);

    // Health outcomes must not change a maintenance status.
    instance.perform_health_check().await;
    assert_eq!(instance.status().await, ServerStatus::Maintenance);

    instance.set_maintenance(false).await;
    assert_eq!(instance.status().await, ServerStatus::Online);
}

#[tokio::test]
async fn shutdown_clears_storage_and_unhealthies_the_balancer() {
    let fx = fixture();
    let base = serve_sync_worker("s1", json!({})).await;
    fx.pool
        .initialize(worker_config("s1", &base, 2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    fx.pool.shutdown(&ServerId("s1".to_string())).await.unwrap();

    assert!(fx.pool.get(&ServerId("s1".to_string())).is_none());
    let store = fx.backend.namespace("server:s1");
    assert!(store.get("status").is_none());

    let status = fx.balancer.status().await;
    assert!(status.healthy_servers.is_empty());
}

#[tokio::test]
async fn dispatch_sends_bearer_when_api_key_set() {
    let fx = fixture();

    let seen = Arc::new(tokio::sync::Mutex::new(None::<String>));
    let seen_handle = seen.clone();
    let base = serve(Router::new().route(
        "/predict",
        post(
            move |headers: axum::http::HeaderMap, Json(_body): Json<Value>| {
                let seen = seen_handle.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    *seen.lock().await = auth;
                    Json(json!({}))
                }
            },
        ),
    ))
    .await;

    let mut config = worker_config("s1", &base, 2);
    config.api_key = Some("secret-key".to_string());
    fx.pool.initialize(config).await.unwrap();

    let instance = fx.pool.get(&ServerId("s1".to_string())).unwrap();
    instance
        .execute_task(&TaskId("t1".to_string()), &request(false), "http://cb/t1")
        .await
        .unwrap();

    assert_eq!(seen.lock().await.as_deref(), Some("Bearer secret-key"));
}
