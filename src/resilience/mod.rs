//! Resilience layer for external dependencies.
//!
//! - [`CircuitBreaker`]: per-service closed/open/half-open state machine
//! - [`FailoverManager`]: breaker registry with registered fallbacks
//! - [`RetryPolicy`]: exponential backoff, composed inside breaker calls

mod circuit_breaker;
mod failover;
mod retry;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerSummary, CircuitState};
pub use failover::{services, FailoverManager, Fallback};
pub use retry::RetryPolicy;
