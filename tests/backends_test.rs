//! Integration tests for the Neo4j and Pinecone backends
//!
//! Both are HTTP services, mocked here with wiremock.

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

use ava_olo::backends::{BackendStatus, GraphStore, VectorStore};
use ava_olo::config::{GraphConfig, LlmConfig, RequestConfig, VectorConfig};
use ava_olo::error::BackendError;
use ava_olo::llm::LlmClient;

fn request_config() -> RequestConfig {
    RequestConfig {
        timeout_ms: 5000,
        max_retries: 0,
        retry_delay_ms: 10,
    }
}

fn graph_store(server: &MockServer) -> GraphStore {
    let config = GraphConfig {
        uri: Some(server.uri()),
        user: "neo4j".to_string(),
        password: "secret".to_string(),
        database: "neo4j".to_string(),
    };
    GraphStore::from_config(&config, &request_config(), false).expect("graph store")
}

fn vector_store(server: &MockServer) -> VectorStore {
    let llm = LlmConfig {
        api_key: Some("test-api-key".to_string()),
        base_url: format!("{}/v1", server.uri()),
        model: "gpt-4o-mini".to_string(),
        embedding_model: "text-embedding-3-small".to_string(),
    };
    let embedder = LlmClient::new(&llm, "test-api-key", &request_config()).expect("client");
    let config = VectorConfig {
        enabled: true,
        host: Some(server.uri()),
        api_key: Some("pc-key".to_string()),
        top_k: 2,
    };
    VectorStore::from_config(&config, &request_config(), Some(embedder), false)
        .expect("vector store")
}

async fn mock_embeddings(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}]
        })))
        .mount(server)
        .await;
}

#[cfg(test)]
mod graph_tests {
    use super::*;

    #[tokio::test]
    async fn test_run_returns_rows() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "statements": [{"statement": "MATCH (f:Farmer) RETURN f.id"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"columns": ["f.id"], "data": [{"row": [1]}, {"row": [2]}]}],
                "errors": []
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = graph_store(&mock_server);
        assert!(store.is_enabled());
        let rows = store
            .run("MATCH (f:Farmer) RETURN f.id", json!({}))
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![json!(1)], vec![json!(2)]]);
    }

    #[tokio::test]
    async fn test_transaction_error_is_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [],
                "errors": [{"code": "Neo.ClientError.Statement.SyntaxError", "message": "bad"}]
            })))
            .mount(&mock_server)
            .await;

        let store = graph_store(&mock_server);
        let result = store.run("NOT CYPHER", json!({})).await;
        match result {
            Err(BackendError::Graph { message }) => {
                assert!(message.contains("SyntaxError"));
            }
            other => panic!("Expected graph error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upsert_farmer_node_sends_parameters() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .and(body_partial_json(json!({
                "statements": [{"parameters": {
                    "farmer_id": 9,
                    "full_name": "Peter Knaflič",
                    "farm_name": "Knaflič Farm"
                }}]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": [], "errors": []})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = graph_store(&mock_server);
        store
            .upsert_farmer_node(9, "Peter Knaflič", Some("Knaflič Farm"), Some("Slovenia"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_check_reports_unhealthy_on_http_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/db/neo4j/tx/commit"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let store = graph_store(&mock_server);
        assert_eq!(store.health_check().await, BackendStatus::Unhealthy);
    }
}

#[cfg(test)]
mod vector_tests {
    use super::*;

    #[tokio::test]
    async fn test_similar_conversations_filters_by_farmer() {
        let mock_server = MockServer::start().await;
        mock_embeddings(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/query"))
            .and(header("Api-Key", "pc-key"))
            .and(body_partial_json(json!({
                "topK": 2,
                "filter": {"farmer_id": {"$eq": 5}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "matches": [
                    {"id": "s-1:3", "score": 0.91, "metadata": {"farmer_id": 5, "text": "Corn planted in April"}},
                    {"id": "s-2:1", "score": 0.72}
                ]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = vector_store(&mock_server);
        let similar = store
            .similar_conversations(5, "When did I plant corn?", store.top_k())
            .await
            .unwrap();

        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].id, "s-1:3");
        assert_eq!(similar[0].text.as_deref(), Some("Corn planted in April"));
        assert!(similar[1].text.is_none());
    }

    #[tokio::test]
    async fn test_upsert_conversation_sends_metadata() {
        let mock_server = MockServer::start().await;
        mock_embeddings(&mock_server).await;

        Mock::given(method("POST"))
            .and(path("/vectors/upsert"))
            .and(body_partial_json(json!({
                "vectors": [{"id": "s-1:4", "metadata": {"farmer_id": 5}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"upsertedCount": 1})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = vector_store(&mock_server);
        store
            .upsert_conversation("s-1:4", 5, "Q: When to harvest? A: In September.")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_embedding_failure_is_vector_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let store = vector_store(&mock_server);
        let result = store.similar_conversations(5, "anything", 2).await;
        assert!(matches!(result, Err(BackendError::Vector { .. })));
    }

    #[tokio::test]
    async fn test_health_check() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/describe_index_stats"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"totalVectorCount": 12})),
            )
            .mount(&mock_server)
            .await;

        let store = vector_store(&mock_server);
        assert_eq!(store.health_check().await, BackendStatus::Healthy);
    }

    #[tokio::test]
    async fn test_dry_run_disables_store() {
        let mock_server = MockServer::start().await;
        let llm = LlmConfig {
            api_key: Some("k".to_string()),
            base_url: mock_server.uri(),
            model: "m".to_string(),
            embedding_model: "e".to_string(),
        };
        let embedder = LlmClient::new(&llm, "k", &request_config()).unwrap();
        let config = VectorConfig {
            enabled: true,
            host: Some(mock_server.uri()),
            api_key: None,
            top_k: 3,
        };
        let store =
            VectorStore::from_config(&config, &request_config(), Some(embedder), true).unwrap();
        assert!(!store.is_enabled());
        assert_eq!(store.health_check().await, BackendStatus::Disabled);
    }
}
