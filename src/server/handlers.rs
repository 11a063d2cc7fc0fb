//! HTTP handlers backed by individual server instances.

use axum::extract::Path;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::pool::ServerPool;
use super::types::MetricsSnapshot;
use crate::error::ApiError;
use crate::runtime::ids::ServerId;

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct MaintenanceResponse {
    pub success: bool,
}

pub async fn set_maintenance(
    Extension(pool): Extension<Arc<ServerPool>>,
    Path(server_id): Path<String>,
    Json(req): Json<MaintenanceRequest>,
) -> Result<Json<MaintenanceResponse>, ApiError> {
    let id = ServerId(server_id);
    let instance = pool
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("server {}", id)))?;

    instance.set_maintenance(req.enabled).await;
    Ok(Json(MaintenanceResponse { success: true }))
}

pub async fn get_metrics(
    Extension(pool): Extension<Arc<ServerPool>>,
    Path(server_id): Path<String>,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    let id = ServerId(server_id);
    let instance = pool
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("server {}", id)))?;

    Ok(Json(instance.get_metrics().await))
}
