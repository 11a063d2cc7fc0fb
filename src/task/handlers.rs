//! HTTP handlers for the task lifecycle.

use axum::extract::Path;
use axum::{Extension, Json};
use std::sync::Arc;

use super::pool::TaskPool;
use super::types::{LifecycleResponse, Task, TaskRequest, TaskUpdate};
use crate::error::ApiError;
use crate::runtime::ids::TaskId;

/// `POST /api/task`: create a task and dispatch it.
pub async fn create_task(
    Extension(tasks): Extension<Arc<TaskPool>>,
    Json(request): Json<TaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let instance = tasks.lookup(&TaskId::new());
    let task = instance.create_task(request).await?;
    Ok(Json(task))
}

/// `GET /api/task/{id}`: status snapshot.
pub async fn get_task(
    Extension(tasks): Extension<Arc<TaskPool>>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let id = TaskId(task_id);
    let instance = tasks
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("task {}", id)))?;
    Ok(Json(instance.get_status().await?))
}

/// `PUT /api/task/{id}`: worker callback delivering progress or a result.
pub async fn update_task(
    Extension(tasks): Extension<Arc<TaskPool>>,
    Path(task_id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<Task>, ApiError> {
    let id = TaskId(task_id);
    Ok(Json(tasks.update(&id, update).await?))
}

/// `POST /api/task/{id}/retry`.
pub async fn retry_task(
    Extension(tasks): Extension<Arc<TaskPool>>,
    Path(task_id): Path<String>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    let id = TaskId(task_id);
    let instance = tasks
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("task {}", id)))?;

    let retried = instance.retry().await;
    Ok(Json(LifecycleResponse {
        success: retried,
        message: if retried {
            "task re-dispatched".to_string()
        } else {
            "task is not retryable".to_string()
        },
    }))
}

/// `POST /api/task/{id}/cancel`.
pub async fn cancel_task(
    Extension(tasks): Extension<Arc<TaskPool>>,
    Path(task_id): Path<String>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    let id = TaskId(task_id);
    let instance = tasks
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("task {}", id)))?;

    instance.cancel().await?;
    Ok(Json(LifecycleResponse {
        success: true,
        message: "task cancelled".to_string(),
    }))
}
