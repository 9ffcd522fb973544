use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::BackendStatus;
use crate::config::{GraphConfig, RequestConfig};
use crate::error::{BackendError, BackendResult};

/// Neo4j knowledge graph reached through the HTTP transactional endpoint.
pub struct GraphStore {
    client: Option<GraphClient>,
}

struct GraphClient {
    http: Client,
    commit_url: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

impl GraphStore {
    /// Enabled only outside dry-run and when `CAVA_NEO4J_URI` is set.
    pub fn from_config(
        config: &GraphConfig,
        request: &RequestConfig,
        dry_run: bool,
    ) -> BackendResult<Self> {
        let uri = match (&config.uri, dry_run) {
            (Some(uri), false) => uri,
            _ => return Ok(Self::disabled()),
        };

        let http = Client::builder()
            .timeout(Duration::from_millis(request.timeout_ms))
            .build()?;
        let commit_url = format!(
            "{}/db/{}/tx/commit",
            http_endpoint(uri),
            config.database
        );
        info!(endpoint = %commit_url, "Graph store enabled");

        Ok(Self {
            client: Some(GraphClient {
                http,
                commit_url,
                user: config.user.clone(),
                password: config.password.clone(),
            }),
        })
    }

    pub fn disabled() -> Self {
        Self { client: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Run one Cypher statement and return its rows. Disabled stores return no rows.
    pub async fn run(&self, cypher: &str, params: Value) -> BackendResult<Vec<Vec<Value>>> {
        let Some(client) = &self.client else {
            debug!("Graph store disabled, skipping statement");
            return Ok(Vec::new());
        };

        let body = json!({
            "statements": [{ "statement": cypher, "parameters": params }]
        });
        let response = client
            .http
            .post(&client.commit_url)
            .basic_auth(&client.user, Some(&client.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::Graph {
                message: format!("HTTP {}: {}", status.as_u16(), text),
            });
        }

        let tx: TxResponse = response.json().await?;
        if let Some(err) = tx.errors.first() {
            return Err(BackendError::Graph {
                message: format!("{}: {}", err.code, err.message),
            });
        }

        Ok(tx
            .results
            .into_iter()
            .flat_map(|r| r.data.into_iter().map(|d| d.row))
            .collect())
    }

    /// Create or update the farmer node and its farm.
    pub async fn upsert_farmer_node(
        &self,
        farmer_id: i64,
        full_name: &str,
        farm_name: Option<&str>,
        country: Option<&str>,
    ) -> BackendResult<()> {
        self.run(
            "MERGE (f:Farmer {id: $farmer_id}) \
             SET f.full_name = $full_name, f.country = $country \
             WITH f WHERE $farm_name IS NOT NULL \
             MERGE (farm:Farm {name: $farm_name, farmer_id: $farmer_id}) \
             MERGE (f)-[:OWNS]->(farm)",
            json!({
                "farmer_id": farmer_id,
                "full_name": full_name,
                "farm_name": farm_name,
                "country": country,
            }),
        )
        .await
        .map(|_| ())
    }

    pub async fn health_check(&self) -> BackendStatus {
        if !self.is_enabled() {
            return BackendStatus::Disabled;
        }
        match self.run("RETURN 1", json!({})).await {
            Ok(_) => BackendStatus::Healthy,
            Err(_) => BackendStatus::Unhealthy,
        }
    }
}

/// `bolt://host:7687` -> `http://host:7474`; http(s) URIs are used as given.
fn http_endpoint(uri: &str) -> String {
    let uri = uri.trim_end_matches('/');
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    let (scheme, rest) = uri.split_once("://").unwrap_or(("bolt", uri));
    let secure = scheme.ends_with("+s") || scheme.ends_with("+ssc");
    let rest = rest.replace(":7687", ":7474");
    format!("{}://{}", if secure { "https" } else { "http" }, rest)
}
