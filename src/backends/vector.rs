use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::BackendStatus;
use crate::config::{RequestConfig, VectorConfig};
use crate::error::{BackendError, BackendResult};
use crate::llm::LlmClient;

/// A past conversation close to the current message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarConversation {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub text: Option<String>,
}

/// Pinecone index of past conversations, embedded with the LLM provider.
pub struct VectorStore {
    client: Option<VectorClient>,
    top_k: usize,
}

struct VectorClient {
    http: Client,
    host: String,
    api_key: String,
    embedder: LlmClient,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    metadata: Option<Value>,
}

impl VectorStore {
    /// Enabled only with `CAVA_ENABLE_VECTOR`, a host, an embedder and outside dry-run.
    pub fn from_config(
        config: &VectorConfig,
        request: &RequestConfig,
        embedder: Option<LlmClient>,
        dry_run: bool,
    ) -> BackendResult<Self> {
        let top_k = config.top_k.max(1);
        let (host, embedder) = match (&config.host, embedder) {
            (Some(host), Some(embedder)) if config.enabled && !dry_run => (host, embedder),
            _ => return Ok(Self::disabled()),
        };

        let http = Client::builder()
            .timeout(Duration::from_millis(request.timeout_ms))
            .build()?;
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        info!(host = %host, "Vector store enabled");

        Ok(Self {
            client: Some(VectorClient {
                http,
                host,
                api_key: config.api_key.clone().unwrap_or_default(),
                embedder,
            }),
            top_k,
        })
    }

    pub fn disabled() -> Self {
        Self {
            client: None,
            top_k: 3,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Past conversations of `farmer_id` closest to `text`.
    pub async fn similar_conversations(
        &self,
        farmer_id: i64,
        text: &str,
        top_k: usize,
    ) -> BackendResult<Vec<SimilarConversation>> {
        let Some(client) = &self.client else {
            return Ok(Vec::new());
        };

        let vector = client.embed(text).await?;
        let body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "filter": { "farmer_id": { "$eq": farmer_id } },
        });
        let response: QueryResponse = client.post("/query", &body).await?;
        debug!(farmer_id, matches = response.matches.len(), "Vector query completed");

        Ok(response
            .matches
            .into_iter()
            .map(|m| SimilarConversation {
                text: m
                    .metadata
                    .as_ref()
                    .and_then(|meta| meta.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                id: m.id,
                score: m.score,
            })
            .collect())
    }

    /// Index one exchange so later questions can find it.
    pub async fn upsert_conversation(
        &self,
        id: &str,
        farmer_id: i64,
        text: &str,
    ) -> BackendResult<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };

        let vector = client.embed(text).await?;
        let body = json!({
            "vectors": [{
                "id": id,
                "values": vector,
                "metadata": { "farmer_id": farmer_id, "text": text },
            }]
        });
        let _: Value = client.post("/vectors/upsert", &body).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> BackendStatus {
        let Some(client) = &self.client else {
            return BackendStatus::Disabled;
        };
        match client
            .post::<Value>("/describe_index_stats", &json!({}))
            .await
        {
            Ok(_) => BackendStatus::Healthy,
            Err(_) => BackendStatus::Unhealthy,
        }
    }
}

impl VectorClient {
    async fn embed(&self, text: &str) -> BackendResult<Vec<f32>> {
        self.embedder
            .embed(text)
            .await
            .map_err(|e| BackendError::Vector {
                message: format!("embedding failed: {}", e),
            })
    }

    async fn post<R: serde::de::DeserializeOwned>(&self, path: &str, body: &Value) -> BackendResult<R> {
        let response = self
            .http
            .post(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::Vector {
                message: format!("HTTP {}: {}", status.as_u16(), text),
            });
        }
        Ok(response.json().await?)
    }
}
