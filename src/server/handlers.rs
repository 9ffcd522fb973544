use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::SharedState;
use crate::conversation::{ConversationRequest, ConversationResponse};
use crate::error::{ApiError, ApiResult};
use crate::service::HealthReport;
use crate::session::SessionMessage;

/// Body of `POST /conversation/history`
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub farmer_id: i64,
    pub messages: Vec<SessionMessage>,
    pub started_at: DateTime<Utc>,
}

/// `POST /conversation`
pub async fn conversation(
    State(state): State<SharedState>,
    Json(request): Json<ConversationRequest>,
) -> ApiResult<Json<ConversationResponse>> {
    if request.farmer_id <= 0 {
        return Err(ApiError::Validation {
            field: "farmer_id".to_string(),
            reason: "must be a positive integer".to_string(),
        });
    }
    if request.message.trim().is_empty() {
        return Err(ApiError::Validation {
            field: "message".to_string(),
            reason: "cannot be empty".to_string(),
        });
    }

    info!(farmer_id = request.farmer_id, "Conversation request");
    Ok(Json(state.engine.handle_farmer_message(request).await))
}

/// `POST /conversation/history`. Registration answers are not returned.
pub async fn history(
    State(state): State<SharedState>,
    Json(request): Json<HistoryRequest>,
) -> ApiResult<Json<HistoryResponse>> {
    let session = state
        .engine
        .get_history(request.session_id.trim())
        .await?
        .ok_or_else(|| ApiError::NotFound {
            resource: format!("Session {}", request.session_id),
        })?;

    Ok(Json(HistoryResponse {
        session_id: session.session_id,
        farmer_id: session.farmer_id,
        messages: session.messages,
        started_at: session.started_at,
    }))
}

/// `GET /health`
pub async fn health(State(state): State<SharedState>) -> Json<HealthReport> {
    Json(state.health().await)
}
