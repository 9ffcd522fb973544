use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqliteConnection, ValueRef};
use tracing::{debug, info};

use super::{
    scope_generated, ActivityEntry, ChatMessage, FarmUser, FarmUserRole, Farmer, Field,
    FieldCrop, GeneratedKind, IntelligenceLogEntry, NewCrop, NewFarmer, NewField, NewTask,
    ScopedStatement, Storage, Task, TaskMaterial, TaskStatus,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if config.path.as_os_str() == ":memory:" {
            return Self::in_memory().await;
        }

        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// In-memory database for dry-run mode and tests.
    ///
    /// Each SQLite in-memory connection is its own database, so the pool holds
    /// exactly one connection that never expires.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn farmer_exists(&self, farmer_id: i64) -> StorageResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM farmers WHERE id = ?")
            .bind(farmer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn require_farmer(&self, farmer_id: i64) -> StorageResult<()> {
        if self.farmer_exists(farmer_id).await? {
            Ok(())
        } else {
            Err(StorageError::NotFound {
                entity: "Farmer",
                id: farmer_id.to_string(),
            })
        }
    }

    async fn get_field(&self, field_id: i64) -> StorageResult<Option<Field>> {
        let row: Option<FieldRow> = sqlx::query_as(
            r#"
            SELECT id, farmer_id, name, area_hectares, latitude, longitude, country, notes, boundary, created_at
            FROM fields
            WHERE id = ?
            "#,
        )
        .bind(field_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_crop(&self, crop_id: i64) -> StorageResult<FieldCrop> {
        let row: CropRow = sqlx::query_as(
            r#"
            SELECT id, field_id, crop_type, variety, planting_date, status, created_at
            FROM field_crops
            WHERE id = ?
            "#,
        )
        .bind(crop_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    /// Attach field links and materials to task rows.
    async fn hydrate_tasks(&self, rows: Vec<TaskRow>) -> StorageResult<Vec<Task>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let placeholders = vec!["?"; ids.len()].join(", ");

        let field_sql = format!(
            "SELECT task_id, field_id FROM task_fields WHERE task_id IN ({}) ORDER BY field_id",
            placeholders
        );
        let mut field_query = sqlx::query_as::<_, (i64, i64)>(&field_sql);
        for id in &ids {
            field_query = field_query.bind(id);
        }
        let mut fields_by_task: HashMap<i64, Vec<i64>> = HashMap::new();
        for (task_id, field_id) in field_query.fetch_all(&self.pool).await? {
            fields_by_task.entry(task_id).or_default().push(field_id);
        }

        let material_sql = format!(
            "SELECT task_id, product_name, quantity, unit FROM task_materials WHERE task_id IN ({}) ORDER BY id",
            placeholders
        );
        let mut material_query = sqlx::query_as::<_, MaterialRow>(&material_sql);
        for id in &ids {
            material_query = material_query.bind(id);
        }
        let mut materials_by_task: HashMap<i64, Vec<TaskMaterial>> = HashMap::new();
        for row in material_query.fetch_all(&self.pool).await? {
            materials_by_task
                .entry(row.task_id)
                .or_default()
                .push(TaskMaterial {
                    product_name: row.product_name,
                    quantity: row.quantity,
                    unit: row.unit,
                });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let field_ids = fields_by_task.remove(&row.id).unwrap_or_default();
                let materials = materials_by_task.remove(&row.id).unwrap_or_default();
                row.into_task(field_ids, materials)
            })
            .collect())
    }
}

/// Insert one task with its field links and materials on an open transaction.
async fn insert_task(
    conn: &mut SqliteConnection,
    farmer_id: i64,
    task: &NewTask,
) -> StorageResult<i64> {
    for field_id in &task.field_ids {
        let owned: Option<i64> =
            sqlx::query_scalar("SELECT id FROM fields WHERE id = ? AND farmer_id = ?")
                .bind(field_id)
                .bind(farmer_id)
                .fetch_optional(&mut *conn)
                .await?;
        if owned.is_none() {
            return Err(StorageError::NotFound {
                entity: "Field",
                id: field_id.to_string(),
            });
        }
    }

    let task_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (farmer_id, title, description, status, due_date, created_at)
        VALUES (?, ?, ?, 'pending', ?, ?)
        RETURNING id
        "#,
    )
    .bind(farmer_id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.due_date.map(|d| d.to_string()))
    .bind(Utc::now().to_rfc3339())
    .fetch_one(&mut *conn)
    .await?;

    for field_id in &task.field_ids {
        sqlx::query("INSERT OR IGNORE INTO task_fields (task_id, field_id) VALUES (?, ?)")
            .bind(task_id)
            .bind(field_id)
            .execute(&mut *conn)
            .await?;
    }

    for material in &task.materials {
        sqlx::query(
            "INSERT INTO task_materials (task_id, product_name, quantity, unit) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(&material.product_name)
        .bind(material.quantity)
        .bind(&material.unit)
        .execute(&mut *conn)
        .await?;
    }

    Ok(task_id)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_farmer(&self, id: i64) -> StorageResult<Option<Farmer>> {
        let row: Option<FarmerRow> = sqlx::query_as(
            r#"
            SELECT id, full_name, wa_phone_number, password_hash, farm_name, city, country, language, created_at
            FROM farmers
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_farmer_by_phone(&self, phone: &str) -> StorageResult<Option<Farmer>> {
        let row: Option<FarmerRow> = sqlx::query_as(
            r#"
            SELECT id, full_name, wa_phone_number, password_hash, farm_name, city, country, language, created_at
            FROM farmers
            WHERE wa_phone_number = ?
            "#,
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn upsert_farmer(&self, farmer: &NewFarmer) -> StorageResult<Farmer> {
        let preferred_id = match farmer.id {
            Some(id) => {
                if let Some(owner) = self.find_farmer_by_phone(&farmer.wa_phone_number).await? {
                    if owner.id != id {
                        return Err(StorageError::PhoneTaken { owner: owner.id });
                    }
                }
                match self.get_farmer(id).await? {
                    Some(existing) if existing.wa_phone_number != farmer.wa_phone_number => None,
                    _ => Some(id),
                }
            }
            None => None,
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO farmers (id, full_name, wa_phone_number, password_hash, farm_name, city, country, language, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(wa_phone_number) DO UPDATE SET
                full_name = excluded.full_name,
                password_hash = COALESCE(excluded.password_hash, farmers.password_hash),
                farm_name = COALESCE(excluded.farm_name, farmers.farm_name),
                city = COALESCE(excluded.city, farmers.city),
                country = COALESCE(excluded.country, farmers.country),
                language = COALESCE(excluded.language, farmers.language)
            RETURNING id
            "#,
        )
        .bind(preferred_id)
        .bind(&farmer.full_name)
        .bind(&farmer.wa_phone_number)
        .bind(&farmer.password_hash)
        .bind(&farmer.farm_name)
        .bind(&farmer.city)
        .bind(&farmer.country)
        .bind(&farmer.language)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        debug!(farmer_id = id, "Farmer upserted");
        self.get_farmer(id).await?.ok_or(StorageError::NotFound {
            entity: "Farmer",
            id: id.to_string(),
        })
    }

    async fn add_farm_user(
        &self,
        farmer_id: i64,
        phone: &str,
        role: FarmUserRole,
    ) -> StorageResult<FarmUser> {
        self.require_farmer(farmer_id).await?;

        let row: FarmUserRow = sqlx::query_as(
            r#"
            INSERT INTO farm_users (farmer_id, wa_phone_number, role, active, created_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(farmer_id, wa_phone_number) DO UPDATE SET
                role = excluded.role,
                active = 1
            RETURNING id, farmer_id, wa_phone_number, role, active, created_at
            "#,
        )
        .bind(farmer_id)
        .bind(phone)
        .bind(role.as_str())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn deactivate_farm_user(&self, farmer_id: i64, phone: &str) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE farm_users SET active = 0 WHERE farmer_id = ? AND wa_phone_number = ?",
        )
        .bind(farmer_id)
        .bind(phone)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Farm user",
                id: phone.to_string(),
            });
        }
        Ok(())
    }

    async fn list_farm_users(&self, farmer_id: i64) -> StorageResult<Vec<FarmUser>> {
        let rows: Vec<FarmUserRow> = sqlx::query_as(
            r#"
            SELECT id, farmer_id, wa_phone_number, role, active, created_at
            FROM farm_users
            WHERE farmer_id = ?
            ORDER BY id
            "#,
        )
        .bind(farmer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn log_activity(
        &self,
        farmer_id: i64,
        actor: &str,
        action: &str,
        details: Option<Value>,
    ) -> StorageResult<i64> {
        let details = details.map(|d| d.to_string());
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO farm_activity_log (farmer_id, actor, action, details, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(farmer_id)
        .bind(actor)
        .bind(action)
        .bind(&details)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list_activity(&self, farmer_id: i64, limit: i64) -> StorageResult<Vec<ActivityEntry>> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT id, farmer_id, actor, action, details, created_at
            FROM farm_activity_log
            WHERE farmer_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(farmer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_field(&self, farmer_id: i64, field: &NewField) -> StorageResult<Field> {
        self.require_farmer(farmer_id).await?;

        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let field_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO fields (farmer_id, name, area_hectares, latitude, longitude, country, notes, boundary, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(farmer_id)
        .bind(&field.name)
        .bind(field.area_hectares)
        .bind(field.latitude)
        .bind(field.longitude)
        .bind(&field.country)
        .bind(&field.notes)
        .bind(field.boundary.as_ref().map(|b| b.to_string()))
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(crop) = &field.initial_crop {
            sqlx::query(
                r#"
                INSERT INTO field_crops (field_id, crop_type, variety, planting_date, status, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(field_id)
            .bind(&crop.crop_type)
            .bind(&crop.variety)
            .bind(crop.planting_date.map(|d| d.to_string()))
            .bind(crop.status.as_deref().unwrap_or("active"))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(farmer_id, field_id, "Field created");

        self.get_field(field_id).await?.ok_or(StorageError::NotFound {
            entity: "Field",
            id: field_id.to_string(),
        })
    }

    async fn list_fields(&self, farmer_id: i64) -> StorageResult<Vec<Field>> {
        let rows: Vec<FieldRow> = sqlx::query_as(
            r#"
            SELECT id, farmer_id, name, area_hectares, latitude, longitude, country, notes, boundary, created_at
            FROM fields
            WHERE farmer_id = ?
            ORDER BY id
            "#,
        )
        .bind(farmer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn add_field_crop(&self, field_id: i64, crop: &NewCrop) -> StorageResult<FieldCrop> {
        if self.get_field(field_id).await?.is_none() {
            return Err(StorageError::NotFound {
                entity: "Field",
                id: field_id.to_string(),
            });
        }

        let crop_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO field_crops (field_id, crop_type, variety, planting_date, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(field_id)
        .bind(&crop.crop_type)
        .bind(&crop.variety)
        .bind(crop.planting_date.map(|d| d.to_string()))
        .bind(crop.status.as_deref().unwrap_or("active"))
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        self.get_crop(crop_id).await
    }

    async fn list_field_crops(&self, field_id: i64) -> StorageResult<Vec<FieldCrop>> {
        let rows: Vec<CropRow> = sqlx::query_as(
            r#"
            SELECT id, field_id, crop_type, variety, planting_date, status, created_at
            FROM field_crops
            WHERE field_id = ?
            ORDER BY id
            "#,
        )
        .bind(field_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_task(&self, farmer_id: i64, task: &NewTask) -> StorageResult<Task> {
        self.require_farmer(farmer_id).await?;

        let mut tx = self.pool.begin().await?;
        let task_id = insert_task(&mut *tx, farmer_id, task).await?;
        tx.commit().await?;

        self.get_task(task_id).await?.ok_or(StorageError::NotFound {
            entity: "Task",
            id: task_id.to_string(),
        })
    }

    async fn create_tasks_bulk(
        &self,
        farmer_id: i64,
        tasks: &[NewTask],
    ) -> StorageResult<Vec<Task>> {
        self.require_farmer(farmer_id).await?;

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(insert_task(&mut *tx, farmer_id, task).await?);
        }
        tx.commit().await?;
        debug!(farmer_id, count = ids.len(), "Tasks created in bulk");

        let mut created = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get_task(id).await? {
                created.push(task);
            }
        }
        Ok(created)
    }

    async fn get_task(&self, task_id: i64) -> StorageResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, farmer_id, title, description, status, due_date, completed_at, completion_notes, created_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate_tasks(vec![row]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn list_tasks(
        &self,
        farmer_id: i64,
        status: Option<TaskStatus>,
    ) -> StorageResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, farmer_id, title, description, status, due_date, completed_at, completion_notes, created_at
            FROM tasks
            WHERE farmer_id = ? AND (? IS NULL OR status = ?)
            ORDER BY COALESCE(due_date, '9999-12-31'), id
            "#,
        )
        .bind(farmer_id)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_tasks(rows).await
    }

    async fn complete_task(&self, task_id: i64, notes: Option<&str>) -> StorageResult<Task> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', completed_at = ?, completion_notes = COALESCE(?, completion_notes)
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(notes)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Task",
                id: task_id.to_string(),
            });
        }

        self.get_task(task_id).await?.ok_or(StorageError::NotFound {
            entity: "Task",
            id: task_id.to_string(),
        })
    }

    async fn append_chat_message(
        &self,
        farmer_id: i64,
        session_id: Option<&str>,
        role: &str,
        content: &str,
    ) -> StorageResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chat_messages (farmer_id, session_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(farmer_id)
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn chat_history(&self, farmer_id: i64, limit: i64) -> StorageResult<Vec<ChatMessage>> {
        let mut rows: Vec<ChatRow> = sqlx::query_as(
            r#"
            SELECT id, farmer_id, session_id, role, content, created_at
            FROM chat_messages
            WHERE farmer_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(farmer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_conversation_session(
        &self,
        session_id: &str,
        farmer_id: i64,
        conversation_type: &str,
        new_messages: i64,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO cava_conversation_sessions
                (session_id, farmer_id, conversation_type, total_messages, last_message_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                conversation_type = excluded.conversation_type,
                total_messages = cava_conversation_sessions.total_messages + excluded.total_messages,
                last_message_at = excluded.last_message_at
            "#,
        )
        .bind(session_id)
        .bind(farmer_id)
        .bind(conversation_type)
        .bind(new_messages)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn log_intelligence(&self, entry: &IntelligenceLogEntry) -> StorageResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO cava_intelligence_log (session_id, message_type, llm_analysis, llm_response, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&entry.session_id)
        .bind(&entry.message_type)
        .bind(entry.llm_analysis.to_string())
        .bind(&entry.llm_response)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn execute_generated(&self, farmer_id: i64, sql: &str) -> StorageResult<u64> {
        let statement = scope_generated(sql, GeneratedKind::Write, farmer_id)?;
        self.check_linked_rows(farmer_id, &statement).await?;
        let result = sqlx::query(&statement.sql)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query {
                message: e.to_string(),
            })?;

        debug!(
            farmer_id,
            rows_affected = result.rows_affected(),
            "Generated statement executed"
        );
        Ok(result.rows_affected())
    }

    async fn fetch_generated(&self, farmer_id: i64, sql: &str) -> StorageResult<Vec<Value>> {
        let statement = scope_generated(sql, GeneratedKind::Read, farmer_id)?;
        let rows = sqlx::query(&statement.sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Query {
                message: e.to_string(),
            })?;

        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

impl SqliteStorage {
    /// Every field and task a generated INSERT links to must be the farmer's.
    async fn check_linked_rows(
        &self,
        farmer_id: i64,
        statement: &ScopedStatement,
    ) -> StorageResult<()> {
        let linked = [("fields", &statement.field_ids), ("tasks", &statement.task_ids)];
        for (table, ids) in linked {
            let query = format!("SELECT id FROM {} WHERE id = ? AND farmer_id = ?", table);
            for id in ids {
                let owned: Option<i64> = sqlx::query_scalar(&query)
                    .bind(id)
                    .bind(farmer_id)
                    .fetch_optional(&self.pool)
                    .await?;
                if owned.is_none() {
                    return Err(StorageError::RejectedQuery {
                        message: format!("{} row {} does not belong to farmer {}", table, id, farmer_id),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Convert a dynamically typed row into a JSON object keyed by column name.
fn row_to_json(row: &SqliteRow) -> Value {
    let mut object = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(_) => cell_to_json(row, i),
            Err(_) => Value::Null,
        };
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn cell_to_json(row: &SqliteRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return Value::from(v);
    }
    match row.try_get::<Vec<u8>, _>(i) {
        Ok(bytes) => Value::from(hex::encode(bytes)),
        Err(_) => Value::Null,
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_date(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct FarmerRow {
    id: i64,
    full_name: String,
    wa_phone_number: String,
    password_hash: Option<String>,
    farm_name: Option<String>,
    city: Option<String>,
    country: Option<String>,
    language: Option<String>,
    created_at: String,
}

impl From<FarmerRow> for Farmer {
    fn from(row: FarmerRow) -> Self {
        Self {
            id: row.id,
            full_name: row.full_name,
            wa_phone_number: row.wa_phone_number,
            password_hash: row.password_hash,
            farm_name: row.farm_name,
            city: row.city,
            country: row.country,
            language: row.language,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FarmUserRow {
    id: i64,
    farmer_id: i64,
    wa_phone_number: String,
    role: String,
    active: bool,
    created_at: String,
}

impl From<FarmUserRow> for FarmUser {
    fn from(row: FarmUserRow) -> Self {
        Self {
            id: row.id,
            farmer_id: row.farmer_id,
            wa_phone_number: row.wa_phone_number,
            role: row.role.parse().unwrap_or(FarmUserRole::Member),
            active: row.active,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    id: i64,
    farmer_id: i64,
    actor: String,
    action: String,
    details: Option<String>,
    created_at: String,
}

impl From<ActivityRow> for ActivityEntry {
    fn from(row: ActivityRow) -> Self {
        Self {
            id: row.id,
            farmer_id: row.farmer_id,
            actor: row.actor,
            action: row.action,
            details: row.details.and_then(|d| serde_json::from_str(&d).ok()),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FieldRow {
    id: i64,
    farmer_id: i64,
    name: String,
    area_hectares: Option<f64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    country: Option<String>,
    notes: Option<String>,
    boundary: Option<String>,
    created_at: String,
}

impl From<FieldRow> for Field {
    fn from(row: FieldRow) -> Self {
        Self {
            id: row.id,
            farmer_id: row.farmer_id,
            name: row.name,
            area_hectares: row.area_hectares,
            latitude: row.latitude,
            longitude: row.longitude,
            country: row.country,
            notes: row.notes,
            boundary: row.boundary.and_then(|b| serde_json::from_str(&b).ok()),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CropRow {
    id: i64,
    field_id: i64,
    crop_type: String,
    variety: Option<String>,
    planting_date: Option<String>,
    status: String,
    created_at: String,
}

impl From<CropRow> for FieldCrop {
    fn from(row: CropRow) -> Self {
        Self {
            id: row.id,
            field_id: row.field_id,
            crop_type: row.crop_type,
            variety: row.variety,
            planting_date: parse_date(row.planting_date),
            status: row.status,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    farmer_id: i64,
    title: String,
    description: Option<String>,
    status: String,
    due_date: Option<String>,
    completed_at: Option<String>,
    completion_notes: Option<String>,
    created_at: String,
}

impl TaskRow {
    fn into_task(self, field_ids: Vec<i64>, materials: Vec<TaskMaterial>) -> Task {
        Task {
            id: self.id,
            farmer_id: self.farmer_id,
            title: self.title,
            description: self.description,
            status: self.status.parse().unwrap_or(TaskStatus::Pending),
            due_date: parse_date(self.due_date),
            completed_at: self.completed_at.as_deref().map(parse_timestamp),
            completion_notes: self.completion_notes,
            field_ids,
            materials,
            created_at: parse_timestamp(&self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MaterialRow {
    task_id: i64,
    product_name: String,
    quantity: Option<f64>,
    unit: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: i64,
    farmer_id: i64,
    session_id: Option<String>,
    role: String,
    content: String,
    created_at: String,
}

impl From<ChatRow> for ChatMessage {
    fn from(row: ChatRow) -> Self {
        Self {
            id: row.id,
            farmer_id: row.farmer_id,
            session_id: row.session_id,
            role: row.role,
            content: row.content,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}
