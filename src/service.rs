//! Service lifecycle: builds every dependency from [`Config`] and owns them for
//! the life of the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::backends::{BackendStatus, GraphStore, VectorStore};
use crate::config::Config;
use crate::conversation::{ConversationEngine, EngineParts};
use crate::error::AppResult;
use crate::generator::QueryGenerator;
use crate::llm::LlmClient;
use crate::performance::{CacheStats, ParallelProcessor};
use crate::registration::RegistrationTracker;
use crate::resilience::{services, CircuitBreakerSummary, FailoverManager, RetryPolicy};
use crate::session::{InMemorySessionStore, RedisSessionStore, SessionStore};
use crate::storage::{SqliteStorage, Storage};

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub databases: BTreeMap<&'static str, BackendStatus>,
    pub llm_configured: bool,
    pub dry_run_mode: bool,
    pub session_store: &'static str,
    pub session_store_durable: bool,
    pub circuits: BTreeMap<String, CircuitBreakerSummary>,
    pub cache: CacheStats,
}

impl HealthReport {
    /// Degraded only when some backend is unhealthy; disabled backends do not count.
    fn status_of(databases: &BTreeMap<&'static str, BackendStatus>) -> HealthStatus {
        if databases.values().any(BackendStatus::is_unhealthy) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// The assembled application. Constructed once by [`AvaService::init`] and shared
/// with HTTP handlers.
pub struct AvaService {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub sessions: Arc<dyn SessionStore>,
    pub generator: Arc<QueryGenerator>,
    pub graph: Arc<GraphStore>,
    pub vector: Arc<VectorStore>,
    pub failover: Arc<FailoverManager>,
    pub tracker: Arc<RegistrationTracker>,
    pub engine: Arc<ConversationEngine>,
}

impl AvaService {
    pub async fn init(config: Config) -> AppResult<Self> {
        let failover = Arc::new(FailoverManager::new());
        register_fallbacks(&failover);

        // Relational store
        let storage: Arc<dyn Storage> = if config.dry_run {
            info!("Dry-run mode: using in-memory SQLite");
            Arc::new(SqliteStorage::in_memory().await?)
        } else {
            let storage = SqliteStorage::new(&config.database).await?;
            info!(path = %config.database.path.display(), "Database initialized");
            Arc::new(storage)
        };

        let sessions = session_store(&config).await;

        let llm = LlmClient::from_config(&config.llm, &config.request)?;
        if let Some(client) = &llm {
            info!(model = client.model(), base_url = client.base_url(), "LLM client initialized");
        }

        let generator = Arc::new(QueryGenerator::new(
            llm.clone(),
            Arc::clone(&failover),
            RetryPolicy::from_config(&config.request),
        ));
        let graph = Arc::new(GraphStore::from_config(
            &config.graph,
            &config.request,
            config.dry_run,
        )?);
        let vector = Arc::new(VectorStore::from_config(
            &config.vector,
            &config.request,
            llm,
            config.dry_run,
        )?);
        let tracker = Arc::new(RegistrationTracker::new());

        let engine = Arc::new(ConversationEngine::new(EngineParts {
            session: config.session.clone(),
            cache: config.cache.clone(),
            generator: Arc::clone(&generator),
            storage: Arc::clone(&storage),
            sessions: Arc::clone(&sessions),
            graph: Arc::clone(&graph),
            vector: Arc::clone(&vector),
            failover: Arc::clone(&failover),
            tracker: Arc::clone(&tracker),
        }));

        info!(
            dry_run = config.dry_run,
            session_store = sessions.name(),
            llm_configured = generator.is_llm_configured(),
            graph_enabled = graph.is_enabled(),
            vector_enabled = vector.is_enabled(),
            "AVA OLO service initialized"
        );

        Ok(Self {
            config,
            storage,
            sessions,
            generator,
            graph,
            vector,
            failover,
            tracker,
            engine,
        })
    }

    /// Close the database pool.
    pub async fn shutdown(&self) {
        self.storage.close().await;
        info!("AVA OLO service shut down");
    }

    pub async fn health(&self) -> HealthReport {
        let relational = async {
            match self.storage.ping().await {
                Ok(()) => BackendStatus::Healthy,
                Err(e) => {
                    warn!(error = %e, "Database ping failed");
                    BackendStatus::Unhealthy
                }
            }
        };
        let names = ["sqlite", "sessions", "neo4j", "pinecone"];
        let statuses = ParallelProcessor::new()
            .run_all(vec![
                relational.boxed(),
                self.sessions.health_check(),
                self.graph.health_check().boxed(),
                self.vector.health_check().boxed(),
            ])
            .await;
        let databases: BTreeMap<_, _> = names.into_iter().zip(statuses).collect();

        HealthReport {
            status: HealthReport::status_of(&databases),
            databases,
            llm_configured: self.generator.is_llm_configured(),
            dry_run_mode: self.config.dry_run,
            session_store: self.sessions.name(),
            session_store_durable: self.sessions.is_durable(),
            circuits: self.failover.states(),
            cache: self.engine.cache_stats().await,
        }
    }
}

/// Values served when a backend call fails or its circuit is open.
fn register_fallbacks(failover: &FailoverManager) {
    // No stored session: the engine starts a fresh one.
    failover.register_fallback(services::REDIS, || Value::Null);
    failover.register_fallback(services::PINECONE, || json!([]));
    failover.register_fallback(services::NEO4J, || Value::Null);
}

/// Redis when configured outside dry-run, otherwise process-local memory. An
/// unreachable Redis at startup falls back to memory.
async fn session_store(config: &Config) -> Arc<dyn SessionStore> {
    let ttl = config.session.timeout();
    match (&config.session.redis_url, config.dry_run) {
        (Some(url), false) => {
            match RedisSessionStore::connect(url, config.session.redis_expire_secs).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, sessions will not survive a restart");
                    Arc::new(InMemorySessionStore::new(ttl))
                }
            }
        }
        _ => Arc::new(InMemorySessionStore::new(ttl)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_backends_are_not_degraded() {
        let mut databases = BTreeMap::new();
        databases.insert("sqlite", BackendStatus::Healthy);
        databases.insert("neo4j", BackendStatus::Disabled);
        databases.insert("pinecone", BackendStatus::Disabled);
        assert_eq!(HealthReport::status_of(&databases), HealthStatus::Healthy);

        databases.insert("sessions", BackendStatus::Unhealthy);
        assert_eq!(HealthReport::status_of(&databases), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_dry_run_init_is_healthy() {
        let service = AvaService::init(Config::for_tests()).await.unwrap();
        let report = service.health().await;

        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.dry_run_mode);
        assert!(!report.llm_configured);
        assert_eq!(report.databases["neo4j"], BackendStatus::Disabled);
        assert_eq!(report.databases["pinecone"], BackendStatus::Disabled);
        assert_eq!(report.session_store, "memory");
        assert!(report.circuits.contains_key(services::OPENAI));
        service.shutdown().await;
    }

    #[test]
    fn test_fallbacks_registered() {
        let failover = FailoverManager::new();
        register_fallbacks(&failover);
        assert!(failover.has_fallback(services::REDIS));
        assert!(failover.has_fallback(services::PINECONE));
        assert!(failover.has_fallback(services::NEO4J));
        assert!(!failover.has_fallback(services::OPENAI));
    }
}
