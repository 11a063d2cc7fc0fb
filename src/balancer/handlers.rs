//! HTTP handlers for load-balancer introspection and control.

use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::service::LoadBalancer;
use super::types::{Algorithm, BalancerStatus};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct SetAlgorithmRequest {
    pub algorithm: Algorithm,
}

#[derive(Debug, Serialize)]
pub struct SetAlgorithmResponse {
    pub success: bool,
}

pub async fn get_status(
    Extension(balancer): Extension<Arc<LoadBalancer>>,
) -> Result<Json<BalancerStatus>, ApiError> {
    Ok(Json(balancer.status().await))
}

pub async fn set_algorithm(
    Extension(balancer): Extension<Arc<LoadBalancer>>,
    Json(req): Json<SetAlgorithmRequest>,
) -> Result<Json<SetAlgorithmResponse>, ApiError> {
    balancer.set_algorithm(req.algorithm).await;
    Ok(Json(SetAlgorithmResponse { success: true }))
}
