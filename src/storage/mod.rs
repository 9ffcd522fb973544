//! Relational storage for farmers, fields, crops, tasks, chat history and the
//! conversation audit trail.
//!
//! The [`Storage`] trait is implemented by [`SqliteStorage`]; dry-run mode runs
//! it against an in-memory database.

mod generated;
mod sqlite;

pub use generated::{
    scope_generated, validate_generated, GeneratedKind, ScopedStatement, MAX_GENERATED_ROWS,
};
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageResult;

/// A registered farmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Farmer {
    pub id: i64,
    pub full_name: String,
    pub wa_phone_number: String,
    /// Never serialized into API responses.
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    pub farm_name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Values for creating or updating a farmer, keyed by phone number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewFarmer {
    /// Preferred id for a new record; ignored when taken by another phone number.
    pub id: Option<i64>,
    pub full_name: String,
    pub wa_phone_number: String,
    pub password_hash: Option<String>,
    pub farm_name: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
}

/// Role of a phone number within a farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FarmUserRole {
    Owner,
    Member,
    Worker,
}

impl FarmUserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FarmUserRole::Owner => "owner",
            FarmUserRole::Member => "member",
            FarmUserRole::Worker => "worker",
        }
    }
}

impl std::str::FromStr for FarmUserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(FarmUserRole::Owner),
            "member" => Ok(FarmUserRole::Member),
            "worker" => Ok(FarmUserRole::Worker),
            other => Err(format!("unknown farm user role: {}", other)),
        }
    }
}

/// A phone number with access to a farm. Users are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmUser {
    pub id: i64,
    pub farmer_id: i64,
    pub wa_phone_number: String,
    pub role: FarmUserRole,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only farm activity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub farmer_id: i64,
    pub actor: String,
    pub action: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A farmer's field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: i64,
    pub farmer_id: i64,
    pub name: String,
    pub area_hectares: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country: Option<String>,
    pub notes: Option<String>,
    /// Polygon coordinates as drawn on the dashboard map.
    pub boundary: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewField {
    pub name: String,
    #[serde(default)]
    pub area_hectares: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub boundary: Option<Value>,
    /// Crop planted on the field at creation.
    #[serde(default)]
    pub initial_crop: Option<NewCrop>,
}

/// A crop planted on a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCrop {
    pub id: i64,
    pub field_id: i64,
    pub crop_type: String,
    pub variety: Option<String>,
    pub planting_date: Option<NaiveDate>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewCrop {
    pub crop_type: String,
    #[serde(default)]
    pub variety: Option<String>,
    #[serde(default)]
    pub planting_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Material used by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMaterial {
    pub product_name: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// A farm task. Fields are linked through `task_fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub farmer_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub due_date: Option<NaiveDate>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completion_notes: Option<String>,
    pub field_ids: Vec<i64>,
    pub materials: Vec<TaskMaterial>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub field_ids: Vec<i64>,
    #[serde(default)]
    pub materials: Vec<TaskMaterial>,
}

/// One stored chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub farmer_id: i64,
    pub session_id: Option<String>,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Audit row for one analyzed message.
#[derive(Debug, Clone, PartialEq)]
pub struct IntelligenceLogEntry {
    pub session_id: String,
    pub message_type: String,
    pub llm_analysis: Value,
    pub llm_response: String,
}

/// Storage trait for database operations.
#[async_trait]
pub trait Storage: Send + Sync {
    // Farmers

    async fn get_farmer(&self, id: i64) -> StorageResult<Option<Farmer>>;
    async fn find_farmer_by_phone(&self, phone: &str) -> StorageResult<Option<Farmer>>;
    /// Insert or update the farmer with this phone number. With a preferred id,
    /// a phone that belongs to another farmer fails with `PhoneTaken` and
    /// nothing is written.
    async fn upsert_farmer(&self, farmer: &NewFarmer) -> StorageResult<Farmer>;

    // Farm users

    /// Add (or reactivate) a phone number on a farm.
    async fn add_farm_user(
        &self,
        farmer_id: i64,
        phone: &str,
        role: FarmUserRole,
    ) -> StorageResult<FarmUser>;
    async fn deactivate_farm_user(&self, farmer_id: i64, phone: &str) -> StorageResult<()>;
    async fn list_farm_users(&self, farmer_id: i64) -> StorageResult<Vec<FarmUser>>;

    // Activity log

    async fn log_activity(
        &self,
        farmer_id: i64,
        actor: &str,
        action: &str,
        details: Option<Value>,
    ) -> StorageResult<i64>;
    /// Most recent entries first.
    async fn list_activity(&self, farmer_id: i64, limit: i64) -> StorageResult<Vec<ActivityEntry>>;

    // Fields and crops

    /// Create a field, planting `initial_crop` in the same transaction.
    async fn create_field(&self, farmer_id: i64, field: &NewField) -> StorageResult<Field>;
    async fn list_fields(&self, farmer_id: i64) -> StorageResult<Vec<Field>>;
    async fn add_field_crop(&self, field_id: i64, crop: &NewCrop) -> StorageResult<FieldCrop>;
    async fn list_field_crops(&self, field_id: i64) -> StorageResult<Vec<FieldCrop>>;

    // Tasks

    async fn create_task(&self, farmer_id: i64, task: &NewTask) -> StorageResult<Task>;
    /// All-or-nothing.
    async fn create_tasks_bulk(&self, farmer_id: i64, tasks: &[NewTask])
        -> StorageResult<Vec<Task>>;
    async fn get_task(&self, task_id: i64) -> StorageResult<Option<Task>>;
    async fn list_tasks(
        &self,
        farmer_id: i64,
        status: Option<TaskStatus>,
    ) -> StorageResult<Vec<Task>>;
    async fn complete_task(&self, task_id: i64, notes: Option<&str>) -> StorageResult<Task>;

    // Chat

    async fn append_chat_message(
        &self,
        farmer_id: i64,
        session_id: Option<&str>,
        role: &str,
        content: &str,
    ) -> StorageResult<i64>;
    /// The last `limit` messages, oldest first.
    async fn chat_history(&self, farmer_id: i64, limit: i64) -> StorageResult<Vec<ChatMessage>>;

    // Audit

    /// Create the session row or bump its counters.
    async fn upsert_conversation_session(
        &self,
        session_id: &str,
        farmer_id: i64,
        conversation_type: &str,
        new_messages: i64,
    ) -> StorageResult<()>;
    async fn log_intelligence(&self, entry: &IntelligenceLogEntry) -> StorageResult<i64>;

    // Generated queries

    /// Execute one generated INSERT/UPDATE confined to `farmer_id`'s rows,
    /// returning rows affected.
    async fn execute_generated(&self, farmer_id: i64, sql: &str) -> StorageResult<u64>;
    /// Run one generated SELECT over `farmer_id`'s rows only, returning at most
    /// [`MAX_GENERATED_ROWS`] rows as JSON objects.
    async fn fetch_generated(&self, farmer_id: i64, sql: &str) -> StorageResult<Vec<Value>>;

    // Lifecycle

    async fn ping(&self) -> StorageResult<()>;
    async fn close(&self);
}
