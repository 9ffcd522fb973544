//! End-to-end conversation tests
//!
//! Runs the full service in dry-run mode: in-memory SQLite, in-memory sessions
//! and no LLM, so every turn goes through the heuristic path.

use std::sync::Arc;

use ava_olo::config::Config;
use ava_olo::generator::ConversationType;
use ava_olo::registration::RegistrationField;
use ava_olo::session::REDACTED;
use ava_olo::storage::NewFarmer;
use ava_olo::{AvaService, ConversationRequest, ConversationResponse};

async fn create_test_service() -> Arc<AvaService> {
    Arc::new(
        AvaService::init(Config::for_tests())
            .await
            .expect("Failed to initialize service"),
    )
}

/// Send messages in order on one session, returning every response.
async fn converse(
    service: &AvaService,
    farmer_id: i64,
    messages: &[&str],
) -> Vec<ConversationResponse> {
    let mut session_id: Option<String> = None;
    let mut responses = Vec::new();
    for message in messages {
        let mut request = ConversationRequest::new(farmer_id, *message);
        if let Some(id) = &session_id {
            request = request.with_session(id.clone());
        }
        let response = service.engine.handle_farmer_message(request).await;
        session_id = Some(response.session_id.clone());
        responses.push(response);
    }
    responses
}

#[cfg(test)]
mod registration_tests {
    use super::*;

    #[tokio::test]
    async fn test_registration_never_reasks_answers() {
        let service = create_test_service().await;

        let responses = converse(
            &service,
            100,
            &["Peter Knaflič", "+385912345678", "mypassword123", "Farm Name"],
        )
        .await;

        assert!(responses.iter().all(|r| r.success));
        assert!(responses
            .iter()
            .all(|r| r.conversation_type == ConversationType::Registration));

        let asks_phone = responses[0].message.to_lowercase();
        assert!(asks_phone.contains("phone"));
        assert!(!asks_phone.contains("full name"));

        let asks_password = responses[1].message.to_lowercase();
        assert!(asks_password.contains("password"));
        assert!(!asks_password.contains("phone"));

        let asks_farm = responses[2].message.to_lowercase();
        assert!(asks_farm.contains("farm"));
        assert!(!asks_farm.contains("password"));

        let done = &responses[3].message;
        assert!(done.contains("Peter Knaflič"));
        assert!(!done.to_lowercase().contains("what is"));
    }

    #[tokio::test]
    async fn test_completed_registration_is_persisted() {
        let service = create_test_service().await;

        let responses = converse(
            &service,
            101,
            &["Ana Kovač", "+38598765432", "secret-pass", "Kovač Orchards"],
        )
        .await;
        assert!(responses[3].message.contains("Kovač Orchards"));

        let farmer = service.storage.get_farmer(101).await.unwrap().unwrap();
        assert_eq!(farmer.full_name, "Ana Kovač");
        assert_eq!(farmer.wa_phone_number, "+38598765432");
        assert_eq!(farmer.farm_name.as_deref(), Some("Kovač Orchards"));
        let hash = farmer.password_hash.unwrap();
        assert!(bcrypt::verify("secret-pass", &hash).unwrap());

        // The owner is a farm user and the tracker forgot the finished session.
        let users = service.storage.list_farm_users(101).await.unwrap();
        assert_eq!(users.len(), 1);
        assert!(service.tracker.session_for(101).is_none());

        let session = service
            .engine
            .get_history(&responses[3].session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(session.registration.completed);
        assert_eq!(session.registration.farmer_record_id, Some(101));
    }

    #[tokio::test]
    async fn test_password_never_stored_in_plaintext() {
        let service = create_test_service().await;

        let responses = converse(
            &service,
            102,
            &["Ivan Horvat", "+385911111111", "hunter2hunter2"],
        )
        .await;

        let session = service
            .engine
            .get_history(&responses[2].session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(session.messages.iter().any(|m| m.content == REDACTED));
        assert!(session
            .messages
            .iter()
            .all(|m| !m.content.contains("hunter2hunter2")));

        let chat = service.storage.chat_history(102, 100).await.unwrap();
        assert!(!chat.is_empty());
        assert!(chat.iter().all(|m| !m.content.contains("hunter2hunter2")));
    }

    #[tokio::test]
    async fn test_concurrent_turns_on_one_session_keep_both_fields() {
        let service = create_test_service().await;
        let session_id = "concurrent-session".to_string();

        let first = {
            let service = Arc::clone(&service);
            let request = ConversationRequest::new(103, "Peter Knaflič").with_session(session_id.clone());
            tokio::spawn(async move { service.engine.handle_farmer_message(request).await })
        };
        let second = {
            let service = Arc::clone(&service);
            let request = ConversationRequest::new(103, "+385912345678").with_session(session_id.clone());
            tokio::spawn(async move { service.engine.handle_farmer_message(request).await })
        };

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(first.success && second.success);

        let session = service
            .engine
            .get_history(&session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            session.registration.get(RegistrationField::FullName),
            Some("Peter Knaflič")
        );
        assert_eq!(
            session.registration.get(RegistrationField::WaPhoneNumber),
            Some("+385912345678")
        );
        assert_eq!(session.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_registration_cannot_claim_another_farmers_phone() {
        let service = create_test_service().await;
        service
            .storage
            .upsert_farmer(&NewFarmer {
                id: Some(3),
                full_name: "Ivan Horvat".to_string(),
                wa_phone_number: "+385911111111".to_string(),
                password_hash: Some("$2b$owner".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let responses = converse(
            &service,
            7,
            &["Mallory Smith", "+385911111111", "attackerpw1", "Evil Farm"],
        )
        .await;

        let refused = responses[1].message.to_lowercase();
        assert!(refused.contains("already registered"));
        assert!(refused.contains("phone"));
        // The phone is asked for again, so later answers never complete the account.
        assert!(responses[2..]
            .iter()
            .all(|r| r.message.to_lowercase().contains("phone")));

        let owner = service.storage.get_farmer(3).await.unwrap().unwrap();
        assert_eq!(owner.full_name, "Ivan Horvat");
        assert_eq!(owner.password_hash.as_deref(), Some("$2b$owner"));
        assert!(service.storage.get_farmer(7).await.unwrap().is_none());

        let session = service
            .engine
            .get_history(&responses[3].session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.registration.completed);
        assert!(session.registration.farmer_record_id.is_none());
        assert!(session.registration.wa_phone_number.is_none());
    }

    #[tokio::test]
    async fn test_registration_continues_after_phone_is_replaced() {
        let service = create_test_service().await;
        service
            .storage
            .upsert_farmer(&NewFarmer {
                id: Some(3),
                full_name: "Ivan Horvat".to_string(),
                wa_phone_number: "+385911111111".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let responses = converse(
            &service,
            8,
            &[
                "Mara Kos",
                "+385911111111",
                "+385922222222",
                "marapass99",
                "Kos Vineyard",
            ],
        )
        .await;
        assert!(responses[1].message.contains("already registered"));
        assert!(responses[2].message.to_lowercase().contains("password"));

        let farmer = service.storage.get_farmer(8).await.unwrap().unwrap();
        assert_eq!(farmer.wa_phone_number, "+385922222222");
        let owner = service.storage.get_farmer(3).await.unwrap().unwrap();
        assert_eq!(owner.full_name, "Ivan Horvat");
    }

    #[tokio::test]
    async fn test_repeated_answer_does_not_change_state() {
        let service = create_test_service().await;

        let responses = converse(&service, 104, &["Marko Babić", "Marko Babić"]).await;
        assert_eq!(responses[0].session_id, responses[1].session_id);

        let session = service
            .engine
            .get_history(&responses[1].session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.registration.full_name.as_deref(), Some("Marko Babić"));
        assert!(session.registration.wa_phone_number.is_none());
        assert!(responses[1].message.to_lowercase().contains("phone"));
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_history_is_bounded() {
        let service = create_test_service().await;
        let limit = service.config.session.history_limit;

        let messages: Vec<String> = (0..40).map(|i| format!("hello number {}", i)).collect();
        let refs: Vec<&str> = messages.iter().map(String::as_str).collect();
        let responses = converse(&service, 105, &refs).await;

        let session = service
            .engine
            .get_history(&responses[39].session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.messages.len(), limit);
        // The newest exchange is kept.
        assert!(session
            .messages
            .iter()
            .any(|m| m.content == "hello number 39"));
        assert!(session
            .messages
            .iter()
            .all(|m| m.content != "hello number 0"));
    }

    #[tokio::test]
    async fn test_unknown_session_history_is_none() {
        let service = create_test_service().await;
        assert!(service
            .engine
            .get_history("no-such-session")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_dry_run_responses_are_marked_degraded() {
        let service = create_test_service().await;

        let responses = converse(&service, 106, &["Peter Knaflič"]).await;
        assert!(responses[0].success);
        assert!(responses[0].degraded);
    }
}

#[cfg(test)]
mod farming_tests {
    use super::*;
    use ava_olo::storage::{NewCrop, NewField};

    #[tokio::test]
    async fn test_registered_farmer_asks_about_fields() {
        let service = create_test_service().await;
        converse(
            &service,
            107,
            &["Peter Knaflič", "+385912345678", "mypassword123", "Knaflič Farm"],
        )
        .await;

        service
            .storage
            .create_field(
                107,
                &NewField {
                    name: "Lower meadow".to_string(),
                    initial_crop: Some(NewCrop {
                        crop_type: "corn".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let responses = converse(&service, 107, &["Which fields do I have?"]).await;
        let answer = &responses[0];
        assert!(answer.success);
        assert_eq!(answer.conversation_type, ConversationType::Farming);
        assert!(answer.message.contains("Lower meadow"));
    }

    #[tokio::test]
    async fn test_registered_farmer_greeting_is_chat() {
        let service = create_test_service().await;
        converse(
            &service,
            108,
            &["Ana Kovač", "+38598765432", "secret-pass", "Kovač Orchards"],
        )
        .await;

        let responses = converse(&service, 108, &["hello"]).await;
        assert!(responses[0].success);
        assert_eq!(responses[0].conversation_type, ConversationType::GeneralChat);
        assert!(!responses[0].message.to_lowercase().contains("phone"));
    }
}
