//! Circuit breaker guarding calls to one external dependency.
//!
//! The breaker uses the standard closed/open/half-open state machine.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Rejecting all calls after too many consecutive failures
//! - **Half-Open**: Testing recovery, admitting a limited number of trial calls

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ResilienceError;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Rejecting all calls - too many failures
    Open,
    /// Testing recovery - admitting trial calls
    HalfOpen,
}

impl CircuitState {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            _ => Err(format!("Unknown circuit state: {}", s)),
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before trial calls are admitted
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open; the same number of successes closes the circuit
    pub half_open_max_calls: u32,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            half_open_max_calls: 3,
        }
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls.max(1);
        self
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

/// Outcome of asking the breaker to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Rejected,
    Admitted,
    /// Half-open trial call, tagged with the state generation it was admitted in
    Trial(u64),
}

/// Mutable breaker bookkeeping, guarded by the breaker's mutex.
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_calls: u32,
    /// Bumped on every state transition
    generation: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_calls: 0,
            generation: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
            last_failure: None,
            last_state_change: Instant::now(),
        }
    }

    fn try_acquire(&mut self, service: &str, config: &BreakerConfig) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .map(|at| at.elapsed() >= config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.transition_to(service, CircuitState::HalfOpen);
                    self.half_open_calls = 1;
                    Admission::Trial(self.generation)
                } else {
                    self.total_rejections += 1;
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < config.half_open_max_calls {
                    self.half_open_calls += 1;
                    Admission::Trial(self.generation)
                } else {
                    self.total_rejections += 1;
                    Admission::Rejected
                }
            }
        }
    }

    /// Give back a trial slot whose call never finished.
    fn release_trial(&mut self, generation: u64) {
        if self.state == CircuitState::HalfOpen && self.generation == generation {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    fn record_success(&mut self, service: &str, config: &BreakerConfig) {
        self.consecutive_failures = 0;
        self.total_successes += 1;

        if self.state == CircuitState::HalfOpen {
            self.consecutive_successes += 1;
            if self.consecutive_successes >= config.half_open_max_calls {
                self.transition_to(service, CircuitState::Closed);
            }
        }
    }

    fn record_failure(&mut self, service: &str, config: &BreakerConfig) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.total_failures += 1;
        self.last_failure = Some(Instant::now());

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= config.failure_threshold {
                    self.transition_to(service, CircuitState::Open);
                }
            }
            // Failed during recovery - go back to open
            CircuitState::HalfOpen => self.transition_to(service, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition_to(&mut self, service: &str, new_state: CircuitState) {
        tracing::info!(
            service = %service,
            from = %self.state,
            to = %new_state,
            consecutive_failures = self.consecutive_failures,
            consecutive_successes = self.consecutive_successes,
            "Circuit breaker state transition"
        );
        self.state = new_state;
        self.generation += 1;
        self.last_state_change = Instant::now();
        self.half_open_calls = 0;
        if new_state != CircuitState::HalfOpen {
            self.consecutive_successes = 0;
        }
        if new_state == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
    }
}

/// Circuit breaker for a single named service.
///
/// Shared between concurrent requests; the lock is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// An open circuit returns [`ResilienceError::CircuitOpen`] without invoking
    /// `operation`. Operation errors update the statistics and are returned unchanged
    /// inside [`ResilienceError::Operation`]. A half-open trial call that is
    /// dropped before finishing gives its slot back.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.lock().try_acquire(&self.service, &self.config);
        let mut slot = TrialSlot {
            breaker: self,
            generation: match admission {
                Admission::Rejected => {
                    tracing::debug!(service = %self.service, "Call rejected, circuit open");
                    return Err(ResilienceError::CircuitOpen {
                        service: self.service.clone(),
                    });
                }
                Admission::Admitted => None,
                Admission::Trial(generation) => Some(generation),
            },
        };

        let outcome = operation().await;
        slot.generation = None;

        match outcome {
            Ok(value) => {
                self.lock().record_success(&self.service, &self.config);
                Ok(value)
            }
            Err(e) => {
                self.lock().record_failure(&self.service, &self.config);
                Err(ResilienceError::Operation(e))
            }
        }
    }

    /// Record a failure observed outside [`call`](Self::call).
    pub fn record_failure(&self) {
        self.lock().record_failure(&self.service, &self.config);
    }

    /// Record a success observed outside [`call`](Self::call).
    pub fn record_success(&self) {
        self.lock().record_success(&self.service, &self.config);
    }

    /// Current state. An open circuit past its recovery timeout still reports `Open`
    /// until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut core = self.lock();
        tracing::info!(
            service = %self.service,
            from = %core.state,
            "Circuit breaker manually reset to closed"
        );
        core.state = CircuitState::Closed;
        core.consecutive_failures = 0;
        core.consecutive_successes = 0;
        core.half_open_calls = 0;
        core.generation += 1;
        core.last_state_change = Instant::now();
    }

    /// Get a summary of the current state for health reporting.
    pub fn summary(&self) -> CircuitBreakerSummary {
        let core = self.lock();
        let retry_after_ms = match (core.state, core.last_failure) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };

        CircuitBreakerSummary {
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            total_failures: core.total_failures,
            total_successes: core.total_successes,
            total_rejections: core.total_rejections,
            retry_after_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        // Counters stay meaningful even if a holder panicked.
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Half-open slot held for the duration of a trial call.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            tracing::debug!(service = %self.breaker.service, "Trial call dropped, releasing slot");
            self.breaker.lock().release_trial(generation);
        }
    }
}

/// Summary of circuit breaker state for display.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSummary {
    /// Current state
    pub state: CircuitState,
    /// Number of consecutive failures
    pub consecutive_failures: u32,
    /// Number of consecutive half-open successes
    pub consecutive_successes: u32,
    /// Total failures
    pub total_failures: u64,
    /// Total successes
    pub total_successes: u64,
    /// Calls rejected without being attempted
    pub total_rejections: u64,
    /// Milliseconds until trial calls are admitted (if open)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl std::fmt::Display for CircuitBreakerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit Breaker: {} ", self.state.to_string().to_uppercase())?;

        match self.state {
            CircuitState::Closed => {
                write!(f, "({} consecutive failures)", self.consecutive_failures)
            }
            CircuitState::Open => match self.retry_after_ms {
                Some(ms) if ms > 0 => write!(f, "(recovery in {}ms)", ms),
                _ => write!(f, "(recovering soon)"),
            },
            CircuitState::HalfOpen => {
                write!(f, "({} consecutive successes)", self.consecutive_successes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig::new(3, Duration::from_millis(40))
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), ResilienceError<String>> {
        cb.call(|| async { Err::<(), String>("boom".to_string()) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, ResilienceError<String>> {
        cb.call(|| async { Ok::<u32, String>(7) }).await
    }

    #[tokio::test]
    async fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new("openai", test_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("openai", test_config());

        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);

        let err = fail(&cb).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Operation(ref m) if m == "boom"));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_invoke_operation() {
        let cb = CircuitBreaker::new("neo4j", test_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let mut invoked = false;
        let result = cb
            .call(|| {
                invoked = true;
                async { Ok::<(), String>(()) }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert!(!invoked);
        assert_eq!(cb.summary().total_rejections, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("redis", test_config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.consecutive_failures(), 2);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_recovery_timeout_admits_trial_call_after_rejections() {
        let cb = CircuitBreaker::new("pinecone", test_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_max_successes() {
        let cb = CircuitBreaker::new("openai", test_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_reopens_on_single_failure() {
        let cb = CircuitBreaker::new("openai", test_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        succeed(&cb).await.unwrap();
        assert!(matches!(
            fail(&cb).await.unwrap_err(),
            ResilienceError::Operation(_)
        ));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_cancelled_trial_calls_release_their_slots() {
        let cb = CircuitBreaker::new(
            "openai",
            BreakerConfig::new(1, Duration::from_millis(20)),
        );
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Every trial slot is taken by a call that gets cancelled mid-flight.
        for _ in 0..3 {
            let slow = cb.call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<u32, String>(1)
            });
            assert!(tokio::time::timeout(Duration::from_millis(5), slow)
                .await
                .is_err());
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let cb = CircuitBreaker::new("postgresql", test_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_summary_display() {
        let cb = CircuitBreaker::new("redis", test_config());
        let display = cb.summary().to_string();
        assert!(display.contains("CLOSED"));
    }

    #[test]
    fn test_circuit_state_string_conversion() {
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
        assert_eq!("open".parse::<CircuitState>().unwrap(), CircuitState::Open);
        assert!("sideways".parse::<CircuitState>().is_err());
    }
}
