//! Integration tests for the SQLite storage layer
//!
//! Most tests use an in-memory database; the persistence test opens a file
//! under a temporary directory.

use chrono::NaiveDate;
use serde_json::json;

use ava_olo::config::DatabaseConfig;
use ava_olo::error::StorageError;
use ava_olo::storage::{
    FarmUserRole, IntelligenceLogEntry, NewCrop, NewFarmer, NewField, NewTask, SqliteStorage,
    Storage, TaskMaterial, TaskStatus,
};

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

fn farmer(name: &str, phone: &str) -> NewFarmer {
    NewFarmer {
        full_name: name.to_string(),
        wa_phone_number: phone.to_string(),
        ..Default::default()
    }
}

async fn seed_farmer(storage: &SqliteStorage) -> i64 {
    storage
        .upsert_farmer(&farmer("Marko Horvat", "+38640123456"))
        .await
        .unwrap()
        .id
}

async fn seed_field(storage: &SqliteStorage, farmer_id: i64, name: &str) -> i64 {
    let field = NewField {
        name: name.to_string(),
        area_hectares: Some(2.5),
        ..Default::default()
    };
    storage.create_field(farmer_id, &field).await.unwrap().id
}

#[cfg(test)]
mod farmer_tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get_farmer() {
        let storage = create_test_storage().await;

        let created = storage
            .upsert_farmer(&NewFarmer {
                farm_name: Some("Horvat Farm".to_string()),
                city: Some("Ljubljana".to_string()),
                ..farmer("Marko Horvat", "+38640123456")
            })
            .await
            .unwrap();

        let fetched = storage.get_farmer(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.full_name, "Marko Horvat");
        assert_eq!(fetched.farm_name.as_deref(), Some("Horvat Farm"));

        let by_phone = storage
            .find_farmer_by_phone("+38640123456")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_phone.id, created.id);
    }

    #[tokio::test]
    async fn test_upsert_same_phone_updates_in_place() {
        let storage = create_test_storage().await;

        let first = storage
            .upsert_farmer(&NewFarmer {
                city: Some("Maribor".to_string()),
                ..farmer("Ana Novak", "+38641000000")
            })
            .await
            .unwrap();
        let second = storage
            .upsert_farmer(&NewFarmer {
                farm_name: Some("Novak Vineyards".to_string()),
                ..farmer("Ana Novak-Kos", "+38641000000")
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.full_name, "Ana Novak-Kos");
        // Unset columns keep their earlier values.
        assert_eq!(second.city.as_deref(), Some("Maribor"));
        assert_eq!(second.farm_name.as_deref(), Some("Novak Vineyards"));
    }

    #[tokio::test]
    async fn test_upsert_uses_preferred_id() {
        let storage = create_test_storage().await;

        let created = storage
            .upsert_farmer(&NewFarmer {
                id: Some(42),
                ..farmer("Ivan Kranjc", "+38651222333")
            })
            .await
            .unwrap();
        assert_eq!(created.id, 42);
    }

    #[tokio::test]
    async fn test_preferred_id_taken_by_other_phone_is_ignored() {
        let storage = create_test_storage().await;

        storage
            .upsert_farmer(&NewFarmer {
                id: Some(7),
                ..farmer("First", "+1000")
            })
            .await
            .unwrap();
        let other = storage
            .upsert_farmer(&NewFarmer {
                id: Some(7),
                ..farmer("Second", "+2000")
            })
            .await
            .unwrap();

        assert_ne!(other.id, 7);
        let original = storage.get_farmer(7).await.unwrap().unwrap();
        assert_eq!(original.full_name, "First");
    }

    #[tokio::test]
    async fn test_phone_of_another_farmer_is_not_taken_over() {
        let storage = create_test_storage().await;

        storage
            .upsert_farmer(&NewFarmer {
                id: Some(3),
                password_hash: Some("$2b$owner".to_string()),
                ..farmer("Ivan Horvat", "+385911111111")
            })
            .await
            .unwrap();

        let result = storage
            .upsert_farmer(&NewFarmer {
                id: Some(7),
                password_hash: Some("$2b$other".to_string()),
                ..farmer("Mallory Smith", "+385911111111")
            })
            .await;
        assert!(matches!(result, Err(StorageError::PhoneTaken { owner: 3 })));

        let owner = storage.get_farmer(3).await.unwrap().unwrap();
        assert_eq!(owner.full_name, "Ivan Horvat");
        assert_eq!(owner.password_hash.as_deref(), Some("$2b$owner"));
        assert!(storage.get_farmer(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_missing_farmer() {
        let storage = create_test_storage().await;
        assert!(storage.get_farmer(999).await.unwrap().is_none());
    }
}

#[cfg(test)]
mod farm_user_tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_deactivate_farm_user() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        let user = storage
            .add_farm_user(farmer_id, "+38640999888", FarmUserRole::Worker)
            .await
            .unwrap();
        assert!(user.active);
        assert_eq!(user.role, FarmUserRole::Worker);

        storage
            .deactivate_farm_user(farmer_id, "+38640999888")
            .await
            .unwrap();
        let users = storage.list_farm_users(farmer_id).await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(!users[0].active);

        // Adding again reactivates the same row.
        let again = storage
            .add_farm_user(farmer_id, "+38640999888", FarmUserRole::Member)
            .await
            .unwrap();
        assert_eq!(again.id, user.id);
        assert!(again.active);
        assert_eq!(again.role, FarmUserRole::Member);
    }

    #[tokio::test]
    async fn test_add_farm_user_requires_farmer() {
        let storage = create_test_storage().await;

        let result = storage
            .add_farm_user(404, "+1", FarmUserRole::Owner)
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { entity: "Farmer", .. })));
    }

    #[tokio::test]
    async fn test_deactivate_unknown_user() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        let result = storage.deactivate_farm_user(farmer_id, "+0").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_activity_log_newest_first() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        storage
            .log_activity(farmer_id, "ava", "registered", None)
            .await
            .unwrap();
        storage
            .log_activity(
                farmer_id,
                "ava",
                "recorded",
                Some(json!({"crop": "corn"})),
            )
            .await
            .unwrap();

        let entries = storage.list_activity(farmer_id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "recorded");
        assert_eq!(entries[0].details, Some(json!({"crop": "corn"})));
        assert_eq!(entries[1].action, "registered");
    }
}

#[cfg(test)]
mod field_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_field_with_initial_crop() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        let field = storage
            .create_field(
                farmer_id,
                &NewField {
                    name: "Upper terrace".to_string(),
                    area_hectares: Some(1.2),
                    initial_crop: Some(NewCrop {
                        crop_type: "corn".to_string(),
                        variety: Some("KWS Kashmir".to_string()),
                        planting_date: NaiveDate::from_ymd_opt(2025, 4, 20),
                        status: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let crops = storage.list_field_crops(field.id).await.unwrap();
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].crop_type, "corn");
        assert_eq!(crops[0].status, "active");
        assert_eq!(crops[0].planting_date, NaiveDate::from_ymd_opt(2025, 4, 20));
    }

    #[tokio::test]
    async fn test_create_field_requires_farmer() {
        let storage = create_test_storage().await;

        let result = storage
            .create_field(
                77,
                &NewField {
                    name: "Nowhere".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_fields_scoped_to_farmer() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;
        let other = storage
            .upsert_farmer(&farmer("Other", "+999"))
            .await
            .unwrap()
            .id;

        seed_field(&storage, farmer_id, "North").await;
        seed_field(&storage, farmer_id, "South").await;
        seed_field(&storage, other, "Elsewhere").await;

        let fields = storage.list_fields(farmer_id).await.unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["North", "South"]);
    }

    #[tokio::test]
    async fn test_add_crop_to_missing_field() {
        let storage = create_test_storage().await;

        let result = storage
            .add_field_crop(
                123,
                &NewCrop {
                    crop_type: "wheat".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { entity: "Field", .. })));
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;

    fn spray_task(field_ids: Vec<i64>) -> NewTask {
        NewTask {
            title: "Spray fungicide".to_string(),
            due_date: NaiveDate::from_ymd_opt(2025, 6, 1),
            field_ids,
            materials: vec![TaskMaterial {
                product_name: "Copper".to_string(),
                quantity: Some(2.0),
                unit: Some("kg".to_string()),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_task_links_fields_and_materials() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;
        let north = seed_field(&storage, farmer_id, "North").await;
        let south = seed_field(&storage, farmer_id, "South").await;

        let task = storage
            .create_task(farmer_id, &spray_task(vec![north, south]))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.field_ids, vec![north, south]);
        assert_eq!(task.materials.len(), 1);
        assert_eq!(task.materials[0].product_name, "Copper");

        let fetched = storage.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn test_task_rejects_foreign_field() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;
        let other = storage
            .upsert_farmer(&farmer("Other", "+999"))
            .await
            .unwrap()
            .id;
        let foreign = seed_field(&storage, other, "Theirs").await;

        let result = storage
            .create_task(farmer_id, &spray_task(vec![foreign]))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound { entity: "Field", .. })));
    }

    #[tokio::test]
    async fn test_bulk_create_is_all_or_nothing() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;
        let north = seed_field(&storage, farmer_id, "North").await;

        let result = storage
            .create_tasks_bulk(
                farmer_id,
                &[spray_task(vec![north]), spray_task(vec![north + 100])],
            )
            .await;
        assert!(result.is_err());
        assert!(storage.list_tasks(farmer_id, None).await.unwrap().is_empty());

        let created = storage
            .create_tasks_bulk(farmer_id, &[spray_task(vec![north]), spray_task(vec![])])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_task_and_filter() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        let first = storage
            .create_task(farmer_id, &spray_task(vec![]))
            .await
            .unwrap();
        storage
            .create_task(
                farmer_id,
                &NewTask {
                    title: "Mow".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let done = storage
            .complete_task(first.id, Some("sprayed before the rain"))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.completion_notes.as_deref(), Some("sprayed before the rain"));

        let pending = storage
            .list_tasks(farmer_id, Some(TaskStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "Mow");

        let completed = storage
            .list_tasks(farmer_id, Some(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_missing_task() {
        let storage = create_test_storage().await;

        let result = storage.complete_task(555, None).await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }
}

#[cfg(test)]
mod chat_and_audit_tests {
    use super::*;

    #[tokio::test]
    async fn test_chat_history_returns_last_messages_oldest_first() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        for i in 0..5 {
            storage
                .append_chat_message(farmer_id, Some("s-1"), "farmer", &format!("message {}", i))
                .await
                .unwrap();
        }

        let history = storage.chat_history(farmer_id, 3).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3", "message 4"]);
        assert_eq!(history[0].session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_conversation_session_counts_messages() {
        let storage = create_test_storage().await;

        storage
            .upsert_conversation_session("s-1", 1, "registration", 2)
            .await
            .unwrap();
        storage
            .upsert_conversation_session("s-1", 1, "farming", 2)
            .await
            .unwrap();

        let total: i64 = sqlx::query_scalar(
            "SELECT total_messages FROM cava_conversation_sessions WHERE session_id = ?",
        )
        .bind("s-1")
        .fetch_one(storage.pool())
        .await
        .unwrap();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn test_log_intelligence_returns_id() {
        let storage = create_test_storage().await;

        let entry = IntelligenceLogEntry {
            session_id: "s-1".to_string(),
            message_type: "farming".to_string(),
            llm_analysis: json!({"intent": "query_data"}),
            llm_response: "Your corn was planted on 20 April.".to_string(),
        };
        let first = storage.log_intelligence(&entry).await.unwrap();
        let second = storage.log_intelligence(&entry).await.unwrap();
        assert!(second > first);
    }
}

#[cfg(test)]
mod generated_query_tests {
    use super::*;

    fn task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn is_rejected<T: std::fmt::Debug>(result: Result<T, StorageError>) -> bool {
        matches!(result, Err(StorageError::RejectedQuery { .. }))
    }

    #[tokio::test]
    async fn test_execute_and_fetch_generated() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;
        let field_id = seed_field(&storage, farmer_id, "North").await;

        let inserted = storage
            .execute_generated(
                farmer_id,
                &format!(
                    "```sql\nINSERT INTO field_crops (field_id, crop_type, status, created_at) VALUES ({}, 'wheat', 'active', '2025-03-01T00:00:00Z');\n```",
                    field_id
                ),
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = storage
            .fetch_generated(
                farmer_id,
                &format!(
                    "SELECT crop_type, status FROM field_crops WHERE field_id = {}",
                    field_id
                ),
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"crop_type": "wheat", "status": "active"})]);
    }

    #[tokio::test]
    async fn test_generated_destructive_statement_rejected() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        assert!(is_rejected(
            storage.execute_generated(farmer_id, "DELETE FROM farmers").await
        ));
        assert!(is_rejected(
            storage
                .fetch_generated(farmer_id, "SELECT * FROM farmers; DROP TABLE farmers")
                .await
        ));

        // Nothing was removed.
        assert_eq!(
            storage
                .fetch_generated(farmer_id, "SELECT id FROM farmers")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_generated_read_never_returns_credentials() {
        let storage = create_test_storage().await;
        let farmer_id = storage
            .upsert_farmer(&NewFarmer {
                password_hash: Some("$2b$secret".to_string()),
                ..farmer("Marko Horvat", "+38640123456")
            })
            .await
            .unwrap()
            .id;

        assert!(is_rejected(
            storage
                .fetch_generated(
                    farmer_id,
                    "SELECT full_name, wa_phone_number, password_hash FROM farmers"
                )
                .await
        ));
        assert!(is_rejected(
            storage.fetch_generated(farmer_id, "SELECT * FROM farm_users").await
        ));

        let rows = storage
            .fetch_generated(farmer_id, "SELECT * FROM farmers")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].get("password_hash").is_none());
        assert!(!rows[0].to_string().contains("$2b$secret"));
    }

    #[tokio::test]
    async fn test_generated_read_sees_only_the_farmers_rows() {
        let storage = create_test_storage().await;
        let marko = seed_farmer(&storage).await;
        let ana = storage
            .upsert_farmer(&farmer("Ana Kovač", "+38598765432"))
            .await
            .unwrap()
            .id;
        seed_field(&storage, marko, "North").await;
        seed_field(&storage, ana, "Orchard").await;
        storage.create_task(ana, &task("Prune apples")).await.unwrap();

        // No farmer_id predicate at all: still only Marko's data.
        let fields = storage
            .fetch_generated(marko, "SELECT name FROM fields")
            .await
            .unwrap();
        assert_eq!(fields, vec![json!({"name": "North"})]);

        let farmers = storage
            .fetch_generated(marko, "SELECT full_name FROM farmers")
            .await
            .unwrap();
        assert_eq!(farmers, vec![json!({"full_name": "Marko Horvat"})]);

        let tasks = storage
            .fetch_generated(marko, "SELECT t.title FROM tasks t JOIN farmers f ON f.id = t.farmer_id")
            .await
            .unwrap();
        assert!(tasks.is_empty());

        // Asking for another farmer's rows explicitly finds nothing either.
        let foreign = storage
            .fetch_generated(marko, &format!("SELECT name FROM fields WHERE farmer_id = {}", ana))
            .await
            .unwrap();
        assert!(foreign.is_empty());
    }

    #[tokio::test]
    async fn test_generated_update_changes_only_the_farmers_rows() {
        let storage = create_test_storage().await;
        let marko = seed_farmer(&storage).await;
        let ana = storage
            .upsert_farmer(&farmer("Ana Kovač", "+38598765432"))
            .await
            .unwrap()
            .id;
        storage.create_task(marko, &task("Spray")).await.unwrap();
        storage.create_task(ana, &task("Spray")).await.unwrap();

        let updated = storage
            .execute_generated(marko, "UPDATE tasks SET completion_notes = 'done early'")
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let theirs = storage.list_tasks(ana, None).await.unwrap();
        assert_eq!(theirs[0].completion_notes, None);

        assert!(is_rejected(
            storage
                .execute_generated(marko, "UPDATE farmers SET full_name = 'pwned'")
                .await
        ));
        let ana_record = storage.get_farmer(ana).await.unwrap().unwrap();
        assert_eq!(ana_record.full_name, "Ana Kovač");
    }

    #[tokio::test]
    async fn test_generated_insert_cannot_link_foreign_rows() {
        let storage = create_test_storage().await;
        let marko = seed_farmer(&storage).await;
        let ana = storage
            .upsert_farmer(&farmer("Ana Kovač", "+38598765432"))
            .await
            .unwrap()
            .id;
        let orchard = seed_field(&storage, ana, "Orchard").await;

        let result = storage
            .execute_generated(
                marko,
                &format!(
                    "INSERT INTO field_crops (field_id, crop_type, created_at) VALUES ({}, 'apple', '2025-03-01')",
                    orchard
                ),
            )
            .await;
        assert!(is_rejected(result));
        assert!(storage.list_field_crops(orchard).await.unwrap().is_empty());

        let result = storage
            .execute_generated(
                marko,
                &format!(
                    "INSERT INTO tasks (farmer_id, title, status, created_at) VALUES ({}, 'x', 'pending', '2025-03-01')",
                    ana
                ),
            )
            .await;
        assert!(is_rejected(result));
        assert!(storage.list_tasks(ana, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generated_literal_with_keywords_is_stored() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        let inserted = storage
            .execute_generated(
                farmer_id,
                &format!(
                    "INSERT INTO farm_activity_log (farmer_id, actor, action, details, created_at) \
                     VALUES ({}, 'farmer', 'Drop in yield', 'It''s the hail', '2025-06-01T00:00:00Z')",
                    farmer_id
                ),
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = storage
            .fetch_generated(farmer_id, "SELECT action, details FROM farm_activity_log")
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![json!({"action": "Drop in yield", "details": "It's the hail"})]
        );
    }

    #[tokio::test]
    async fn test_generated_query_error_is_reported() {
        let storage = create_test_storage().await;
        let farmer_id = seed_farmer(&storage).await;

        let result = storage
            .fetch_generated(farmer_id, "SELECT * FROM no_such_table")
            .await;
        assert!(matches!(result, Err(StorageError::Query { .. })));
    }
}

#[cfg(test)]
mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("ava.db"),
            max_connections: 2,
        };

        let storage = SqliteStorage::new(&config).await.unwrap();
        let farmer_id = seed_farmer(&storage).await;
        storage.ping().await.unwrap();
        storage.close().await;

        let reopened = SqliteStorage::new(&config).await.unwrap();
        let farmer = reopened.get_farmer(farmer_id).await.unwrap();
        assert_eq!(farmer.map(|f| f.full_name).as_deref(), Some("Marko Horvat"));
    }
}
