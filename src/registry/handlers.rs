//! HTTP handlers for fleet administration.

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::service::ServerRegistry;
use super::types::{RegisterServerRequest, ServerFilter, ServerInfo};
use crate::error::ApiError;
use crate::runtime::ids::ServerId;
use crate::server::types::ServerStatus;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerResponse {
    pub server_id: ServerId,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ServerListResponse {
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerListQuery {
    pub status: Option<ServerStatus>,
    pub group: Option<String>,
    pub max_age: Option<u64>,
}

pub async fn register_server(
    Extension(registry): Extension<Arc<ServerRegistry>>,
    Json(req): Json<RegisterServerRequest>,
) -> Result<Json<RegisterServerResponse>, ApiError> {
    let server_id = registry.register_server(req.into_config()).await?;
    Ok(Json(RegisterServerResponse {
        server_id,
        message: "server registered".to_string(),
    }))
}

pub async fn list_servers(
    Extension(registry): Extension<Arc<ServerRegistry>>,
    Query(query): Query<ServerListQuery>,
) -> Result<Json<ServerListResponse>, ApiError> {
    let servers = registry
        .get_available_servers(&ServerFilter {
            status: query.status,
            group: query.group,
            max_age_ms: query.max_age,
        })
        .await;
    Ok(Json(ServerListResponse { servers }))
}

pub async fn heartbeat(
    Extension(registry): Extension<Arc<ServerRegistry>>,
    Path(server_id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    registry.update_heartbeat(&ServerId(server_id)).await?;
    Ok(Json(AckResponse { success: true }))
}

pub async fn unregister_server(
    Extension(registry): Extension<Arc<ServerRegistry>>,
    Path(server_id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    registry.unregister_server(&ServerId(server_id)).await;
    Ok(Json(AckResponse { success: true }))
}
