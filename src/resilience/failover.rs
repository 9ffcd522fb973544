use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use super::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerSummary};
use crate::error::ResilienceError;

/// Service names guarded by the failover manager.
pub mod services {
    pub const REDIS: &str = "redis";
    pub const POSTGRESQL: &str = "postgresql";
    pub const OPENAI: &str = "openai";
    pub const NEO4J: &str = "neo4j";
    pub const PINECONE: &str = "pinecone";
}

/// Fallback producer registered for a service. Returns a canned JSON value that is
/// deserialized into the failed operation's output type.
pub type Fallback = Arc<dyn Fn() -> Value + Send + Sync>;

/// Registry of per-service circuit breakers and fallbacks.
pub struct FailoverManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    fallbacks: DashMap<String, Fallback>,
}

impl FailoverManager {
    /// Create a manager with breakers for every known service.
    pub fn new() -> Self {
        let manager = Self {
            breakers: DashMap::new(),
            fallbacks: DashMap::new(),
        };
        for service in [
            services::REDIS,
            services::POSTGRESQL,
            services::OPENAI,
            services::NEO4J,
            services::PINECONE,
        ] {
            manager.configure(service, Self::default_config(service));
        }
        manager
    }

    /// Per-service thresholds.
    pub fn default_config(service: &str) -> BreakerConfig {
        match service {
            services::REDIS => BreakerConfig::new(3, Duration::from_secs(30)),
            services::POSTGRESQL => BreakerConfig::new(5, Duration::from_secs(60)),
            services::OPENAI => BreakerConfig::new(3, Duration::from_secs(30)),
            services::NEO4J => BreakerConfig::new(3, Duration::from_secs(45)),
            services::PINECONE => BreakerConfig::new(2, Duration::from_secs(20)),
            _ => BreakerConfig::default(),
        }
    }

    /// Replace the breaker for `service` with a fresh one using `config`.
    pub fn configure(&self, service: &str, config: BreakerConfig) {
        self.breakers.insert(
            service.to_string(),
            Arc::new(CircuitBreaker::new(service, config)),
        );
    }

    /// Get the breaker for `service`, creating one with defaults if unknown.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(service.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(service, Self::default_config(service)))
        });
        Arc::clone(entry.value())
    }

    pub fn register_fallback<F>(&self, service: &str, fallback: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.fallbacks.insert(service.to_string(), Arc::new(fallback));
    }

    pub fn has_fallback(&self, service: &str) -> bool {
        self.fallbacks.contains_key(service)
    }

    /// Run `operation` through the service's breaker.
    pub async fn call<T, E, F, Fut>(&self, service: &str, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breaker(service).call(operation).await
    }

    /// Run `operation`; on an open circuit or a failure, answer with the registered
    /// fallback. Without a fallback the original error is returned.
    pub async fn execute_with_failover<T, E, F, Fut>(
        &self,
        service: &str,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        T: DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let err = match self.call(service, operation).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let fallback = self.fallbacks.get(service).map(|f| Arc::clone(f.value()));
        match fallback {
            Some(fallback) => {
                warn!(service = %service, error = %err, "Using fallback");
                serde_json::from_value(fallback()).map_err(|e| ResilienceError::InvalidFallback {
                    service: service.to_string(),
                    message: e.to_string(),
                })
            }
            None => {
                warn!(service = %service, error = %err, "No fallback registered");
                Err(err)
            }
        }
    }

    /// Breaker summaries keyed by service name.
    pub fn states(&self) -> BTreeMap<String, CircuitBreakerSummary> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().summary()))
            .collect()
    }

    pub fn reset(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.reset();
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

impl Default for FailoverManager {
    fn default() -> Self {
        Self::new()
    }
}
