//! Dashboard routes over the relational store.
//!
//! Reads degrade through [`degrade`]: a storage failure yields an empty list
//! flagged `degraded: true` rather than an error page. Writes report errors.

use std::future::Future;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::SharedState;
use crate::error::{ApiError, ApiResult, StorageResult};
use crate::resilience::{services, FailoverManager};
use crate::storage::{ChatMessage, Field, FieldCrop, NewCrop, NewField, NewTask, Task, TaskStatus};

const CHAT_HISTORY_LIMIT: i64 = 100;

/// List response shared by every dashboard read
#[derive(Debug, Clone, Serialize)]
pub struct Listing<T> {
    pub success: bool,
    pub data: Vec<T>,
    pub degraded: bool,
}

/// Response for a successful write
#[derive(Debug, Clone, Serialize)]
pub struct Saved<T> {
    pub success: bool,
    pub data: T,
}

impl<T> Saved<T> {
    fn created(data: T) -> (StatusCode, Json<Self>) {
        (StatusCode::CREATED, Json(Self { success: true, data }))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompleteTask {
    #[serde(default)]
    pub notes: Option<String>,
}

/// Run a dashboard read through the database breaker, degrading to an empty list.
pub async fn degrade<T, Fut>(failover: &FailoverManager, label: &str, read: Fut) -> Json<Listing<T>>
where
    Fut: Future<Output = StorageResult<Vec<T>>>,
{
    match failover.call(services::POSTGRESQL, || read).await {
        Ok(data) => Json(Listing {
            success: true,
            data,
            degraded: false,
        }),
        Err(e) => {
            warn!(read = label, error = %e, "Dashboard read degraded");
            Json(Listing {
                success: true,
                data: Vec::new(),
                degraded: true,
            })
        }
    }
}

fn positive_id(field: &str, id: i64) -> ApiResult<i64> {
    if id > 0 {
        Ok(id)
    } else {
        Err(ApiError::Validation {
            field: field.to_string(),
            reason: "must be a positive integer".to_string(),
        })
    }
}

fn required(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::Validation {
            field: field.to_string(),
            reason: "cannot be empty".to_string(),
        });
    }
    Ok(())
}

/// `GET /farmers/:id/fields`
pub async fn list_fields(
    State(state): State<SharedState>,
    Path(farmer_id): Path<i64>,
) -> ApiResult<Json<Listing<Field>>> {
    let farmer_id = positive_id("farmer_id", farmer_id)?;
    Ok(degrade(&state.failover, "fields", state.storage.list_fields(farmer_id)).await)
}

/// `POST /farmers/:id/fields`
pub async fn create_field(
    State(state): State<SharedState>,
    Path(farmer_id): Path<i64>,
    Json(field): Json<NewField>,
) -> ApiResult<(StatusCode, Json<Saved<Field>>)> {
    let farmer_id = positive_id("farmer_id", farmer_id)?;
    required("name", &field.name)?;
    if let Some(crop) = &field.initial_crop {
        required("initial_crop.crop_type", &crop.crop_type)?;
    }

    let created = state
        .failover
        .call(services::POSTGRESQL, || state.storage.create_field(farmer_id, &field))
        .await?;
    info!(farmer_id, field_id = created.id, "Field created");
    Ok(Saved::created(created))
}

/// `POST /fields/:id/crops`
pub async fn add_crop(
    State(state): State<SharedState>,
    Path(field_id): Path<i64>,
    Json(crop): Json<NewCrop>,
) -> ApiResult<(StatusCode, Json<Saved<FieldCrop>>)> {
    let field_id = positive_id("field_id", field_id)?;
    required("crop_type", &crop.crop_type)?;

    let created = state
        .failover
        .call(services::POSTGRESQL, || state.storage.add_field_crop(field_id, &crop))
        .await?;
    Ok(Saved::created(created))
}

/// `GET /farmers/:id/tasks?status=pending|completed`
pub async fn list_tasks(
    State(state): State<SharedState>,
    Path(farmer_id): Path<i64>,
    Query(filter): Query<TaskFilter>,
) -> ApiResult<Json<Listing<Task>>> {
    let farmer_id = positive_id("farmer_id", farmer_id)?;
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|reason| ApiError::Validation {
            field: "status".to_string(),
            reason,
        })?;
    Ok(degrade(&state.failover, "tasks", state.storage.list_tasks(farmer_id, status)).await)
}

/// `POST /farmers/:id/tasks`
pub async fn create_task(
    State(state): State<SharedState>,
    Path(farmer_id): Path<i64>,
    Json(task): Json<NewTask>,
) -> ApiResult<(StatusCode, Json<Saved<Task>>)> {
    let farmer_id = positive_id("farmer_id", farmer_id)?;
    required("title", &task.title)?;

    let created = state
        .failover
        .call(services::POSTGRESQL, || state.storage.create_task(farmer_id, &task))
        .await?;
    info!(farmer_id, task_id = created.id, "Task created");
    Ok(Saved::created(created))
}

/// `POST /farmers/:id/tasks/bulk`
pub async fn create_tasks_bulk(
    State(state): State<SharedState>,
    Path(farmer_id): Path<i64>,
    Json(tasks): Json<Vec<NewTask>>,
) -> ApiResult<(StatusCode, Json<Saved<Vec<Task>>>)> {
    let farmer_id = positive_id("farmer_id", farmer_id)?;
    if tasks.is_empty() {
        return Err(ApiError::Validation {
            field: "tasks".to_string(),
            reason: "at least one task is required".to_string(),
        });
    }
    for task in &tasks {
        required("title", &task.title)?;
    }

    let created = state
        .failover
        .call(services::POSTGRESQL, || {
            state.storage.create_tasks_bulk(farmer_id, &tasks)
        })
        .await?;
    info!(farmer_id, count = created.len(), "Tasks created");
    Ok(Saved::created(created))
}

/// `POST /tasks/:id/complete`
pub async fn complete_task(
    State(state): State<SharedState>,
    Path(task_id): Path<i64>,
    body: Option<Json<CompleteTask>>,
) -> ApiResult<Json<Saved<Task>>> {
    let task_id = positive_id("task_id", task_id)?;
    let notes = body.and_then(|Json(body)| body.notes);

    let task = state
        .failover
        .call(services::POSTGRESQL, || {
            state.storage.complete_task(task_id, notes.as_deref())
        })
        .await?;
    Ok(Json(Saved {
        success: true,
        data: task,
    }))
}

/// `GET /farmers/:id/chat-history`
pub async fn chat_history(
    State(state): State<SharedState>,
    Path(farmer_id): Path<i64>,
) -> ApiResult<Json<Listing<ChatMessage>>> {
    let farmer_id = positive_id("farmer_id", farmer_id)?;
    Ok(degrade(
        &state.failover,
        "chat_history",
        state.storage.chat_history(farmer_id, CHAT_HISTORY_LIMIT),
    )
    .await)
}
