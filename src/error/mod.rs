use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Circuit open for {service}")]
    CircuitOpen { service: String },

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Relational storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Rejected generated query: {message}")]
    RejectedQuery { message: String },

    #[error("Phone number is already registered to farmer {owner}")]
    PhoneTaken { owner: i64 },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// LLM provider errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from the graph, vector and session cache backends
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Graph store error: {message}")]
    Graph { message: String },

    #[error("Vector store error: {message}")]
    Vector { message: String },

    #[error("Session store error: {message}")]
    SessionStore { message: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by the circuit breaker and failover layer.
///
/// `Operation` carries the wrapped call's own error unchanged.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("Circuit open for {service}")]
    CircuitOpen { service: String },

    #[error("Fallback for {service} returned an unusable value: {message}")]
    InvalidFallback { service: String, message: String },

    #[error("{0}")]
    Operation(#[source] E),
}

impl<E> ResilienceError<E> {
    /// True when the call was rejected without running the operation.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

impl<E> From<ResilienceError<E>> for AppError
where
    E: Into<AppError>,
{
    fn from(err: ResilienceError<E>) -> Self {
        match err {
            ResilienceError::CircuitOpen { service } => AppError::CircuitOpen { service },
            ResilienceError::InvalidFallback { service, message } => AppError::Internal {
                message: format!("fallback for {}: {}", service, message),
            },
            ResilienceError::Operation(e) => e.into(),
        }
    }
}

/// Errors surfaced by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error(transparent)]
    App(#[from] AppError),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => ApiError::NotFound {
                resource: format!("{} {}", entity, id),
            },
            other => ApiError::App(other.into()),
        }
    }
}

impl From<ResilienceError<StorageError>> for ApiError {
    fn from(err: ResilienceError<StorageError>) -> Self {
        match err {
            ResilienceError::Operation(e) => e.into(),
            other => ApiError::App(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::NotFound { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::App(e @ AppError::Validation { .. }) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::App(e) => {
                tracing::error!(error = %e, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type alias for HTTP handlers
pub type ApiResult<T> = Result<T, ApiError>;
