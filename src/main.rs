use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{middleware, Extension, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use task_gateway::auth::{require_admin, require_auth, AuthState};
use task_gateway::balancer::service::LoadBalancer;
use task_gateway::config::GatewayConfig;
use task_gateway::registry::service::ServerRegistry;
use task_gateway::runtime::clock::SystemClock;
use task_gateway::runtime::storage::MemoryBackend;
use task_gateway::server::pool::ServerPool;
use task_gateway::stats::aggregator::StatsRegistry;
use task_gateway::task::pool::TaskPool;
use task_gateway::{balancer, registry, server, stats, task};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);
    tracing::info!("starting task gateway on {}", config.bind_addr);

    let clock = SystemClock::shared();
    let backend = MemoryBackend::new();

    // Wire the actors leaves-first; the two cycle back-edges
    // (balancer -> registry, server pool -> {registry, task pool}) are
    // installed after construction.
    let stats_registry = StatsRegistry::new(clock.clone(), backend.clone());
    let load_balancer = LoadBalancer::new(clock.clone(), backend.namespace("balancer"));
    let server_pool = ServerPool::new(&config, clock.clone(), backend.clone(), load_balancer.clone());
    let server_registry = ServerRegistry::new(
        &config,
        clock.clone(),
        backend.namespace("registry"),
        load_balancer.clone(),
        server_pool.clone(),
    );
    load_balancer.bind_registry(server_registry.clone());
    server_pool.bind_registry(server_registry.clone());

    let task_pool = TaskPool::new(
        clock.clone(),
        backend.clone(),
        config.clone(),
        load_balancer.clone(),
        server_pool.clone(),
        stats_registry.clone(),
    );
    server_pool.bind_tasks(task_pool.clone());

    server_registry.start();
    load_balancer.start();

    let auth_state = AuthState::new(&config.jwt_secret);

    // Fleet administration requires the admin role on top of a valid token.
    let servers_api = Router::new()
        .route(
            "/servers",
            post(registry::handlers::register_server).get(registry::handlers::list_servers),
        )
        .route("/servers/:id", delete(registry::handlers::unregister_server))
        .route("/servers/:id/heartbeat", post(registry::handlers::heartbeat))
        .route(
            "/servers/:id/maintenance",
            put(server::handlers::set_maintenance),
        )
        .route("/servers/:id/metrics", get(server::handlers::get_metrics))
        .route_layer(middleware::from_fn(require_admin));

    let api = Router::new()
        .route("/task", post(task::handlers::create_task))
        .route(
            "/task/:id",
            get(task::handlers::get_task).put(task::handlers::update_task),
        )
        .route("/task/:id/retry", post(task::handlers::retry_task))
        .route("/task/:id/cancel", post(task::handlers::cancel_task))
        .route("/stats", get(stats::handlers::get_stats))
        .route("/stats/hourly", get(stats::handlers::get_hourly))
        .route("/stats/server/:id", get(stats::handlers::get_server_stats))
        .route("/loadbalancer/status", get(balancer::handlers::get_status))
        .route(
            "/loadbalancer/algorithm",
            put(balancer::handlers::set_algorithm),
        )
        .merge(servers_api)
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    let app = Router::new()
        .route("/health", get(handle_health))
        .nest("/api", api)
        .layer(Extension(server_registry.clone()))
        .layer(Extension(load_balancer.clone()))
        .layer(Extension(server_pool.clone()))
        .layer(Extension(task_pool.clone()))
        .layer(Extension(stats_registry.clone()))
        .layer(Extension(config.clone()));

    tracing::info!("HTTP ingress listening on {}", config.bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    servers: usize,
    tasks: usize,
}

async fn handle_health(
    Extension(server_pool): Extension<Arc<ServerPool>>,
    Extension(task_pool): Extension<Arc<TaskPool>>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            servers: server_pool.len(),
            tasks: task_pool.len(),
        }),
    )
}
