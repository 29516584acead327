use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use usher_core::errors::ModelError;
use usher_core::provider::{ModelProvider, PromptContext, ProposedAction};

/// Configuration for the ReliableModel retry and circuit breaker behavior.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    /// Bounded retry count per call. One transport retry per proposal.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a ModelProvider with bounded retry and a circuit breaker.
///
/// - Retries retryable errors with exponential backoff + jitter
/// - Respects `retry_after` hints from rate limit responses
/// - Circuit breaker: N consecutive failures → open → cooldown → half-open → success → closed
pub struct ReliableModel<P: ModelProvider> {
    inner: P,
    config: ReliableConfig,
    circuit_state: Arc<RwLock<CircuitState>>,
    consecutive_failures: Arc<AtomicU32>,
    total_retries: Arc<AtomicU64>,
}

impl<P: ModelProvider> ReliableModel<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: Arc::new(RwLock::new(CircuitState::Closed)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    fn check_circuit(&self) -> Result<(), ModelError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(ModelError::Overloaded)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.circuit_breaker_threshold {
            let mut state = self.circuit_state.write();
            if *state == CircuitState::Closed || *state == CircuitState::HalfOpen {
                warn!(
                    failures,
                    cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                    "circuit breaker opened"
                );
                *state = CircuitState::Open { since: Instant::now() };
            }
        }
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter).max(100.0);

        Duration::from_millis(final_ms as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Decide whether to retry after `error`, sleeping the backoff delay if so.
    async fn should_retry(&self, attempt: u32, error: &ModelError) -> Result<bool, ModelError> {
        if error.is_fatal() || !error.is_retryable() || attempt >= self.config.max_retries {
            self.record_failure();
            return Ok(false);
        }

        let delay = self.retry_delay(attempt, error.suggested_delay());
        self.total_retries.fetch_add(1, Ordering::Relaxed);
        warn!(
            attempt = attempt + 1,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying model call"
        );
        tokio::time::sleep(delay).await;
        self.check_circuit()?;
        Ok(true)
    }
}

#[async_trait]
impl<P: ModelProvider> ModelProvider for ReliableModel<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn propose(&self, context: &PromptContext) -> Result<ProposedAction, ModelError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            match self.inner.propose(context).await {
                Ok(action) => {
                    self.record_success();
                    return Ok(action);
                }
                Err(e) => {
                    if !self.should_retry(attempt, &e).await? {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            match self.inner.generate(prompt).await {
                Ok(text) => {
                    self.record_success();
                    return Ok(text);
                }
                Err(e) => {
                    if !self.should_retry(attempt, &e).await? {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockModel, MockReply};

    fn fast_config() -> ReliableConfig {
        ReliableConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let mock = MockModel::new(vec![MockReply::reply("hello")]);
        let reliable = ReliableModel::with_defaults(mock);

        let result = reliable.propose(&PromptContext::empty()).await;
        assert!(result.is_ok());
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test]
    async fn single_bounded_retry_recovers() {
        let mock = MockModel::new(vec![
            MockReply::Error(ModelError::NetworkError("reset".into())),
            MockReply::reply("recovered"),
        ]);
        let reliable = ReliableModel::new(mock, fast_config());

        let result = reliable.propose(&PromptContext::empty()).await;
        assert!(result.is_ok());
        assert_eq!(reliable.total_retries(), 1);
    }

    #[tokio::test]
    async fn second_transport_failure_surfaces() {
        // Default bound is one retry: two consecutive failures give up
        let mock = MockModel::new(vec![
            MockReply::Error(ModelError::NetworkError("reset".into())),
            MockReply::Error(ModelError::NetworkError("reset again".into())),
            MockReply::reply("unreachable"),
        ]);
        let reliable = ReliableModel::new(mock, fast_config());

        let result = reliable.propose(&PromptContext::empty()).await;
        assert!(matches!(result, Err(ModelError::NetworkError(_))));
        assert_eq!(reliable.total_retries(), 1);
    }

    #[tokio::test]
    async fn fatal_error_not_retried() {
        let mock = MockModel::new(vec![
            MockReply::Error(ModelError::AuthenticationFailed("bad key".into())),
            MockReply::reply("should not reach"),
        ]);
        let reliable = ReliableModel::new(mock, fast_config());

        let err = reliable.propose(&PromptContext::empty()).await.unwrap_err();
        assert!(matches!(err, ModelError::AuthenticationFailed(_)));
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test]
    async fn generate_retries_too() {
        let mock = MockModel::new(vec![]).with_generations(vec![
            Err(ModelError::ServerError { status: 500, body: "oops".into() }),
            Ok("summary text".into()),
        ]);
        let reliable = ReliableModel::new(mock, fast_config());

        let text = reliable.generate("summarize this").await.unwrap();
        assert_eq!(text, "summary text");
        assert_eq!(reliable.total_retries(), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_trips_after_threshold() {
        let mock = MockModel::new(vec![
            MockReply::Error(ModelError::ServerError { status: 500, body: "1".into() }),
            MockReply::Error(ModelError::ServerError { status: 500, body: "2".into() }),
            MockReply::Error(ModelError::ServerError { status: 500, body: "3".into() }),
            MockReply::reply("unreachable"),
        ]);

        let config = ReliableConfig {
            max_retries: 0,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
            ..fast_config()
        };
        let reliable = ReliableModel::new(mock, config);
        let ctx = PromptContext::empty();

        for _ in 0..3 {
            let _ = reliable.propose(&ctx).await;
        }
        assert_eq!(reliable.circuit_state_name(), "open");

        // Rejected by the breaker without hitting the provider
        let err = reliable.propose(&ctx).await.unwrap_err();
        assert!(matches!(err, ModelError::Overloaded));
    }

    #[tokio::test]
    async fn circuit_breaker_recovers_after_cooldown() {
        let mock = MockModel::new(vec![
            MockReply::Error(ModelError::ServerError { status: 500, body: "1".into() }),
            MockReply::Error(ModelError::ServerError { status: 500, body: "2".into() }),
            MockReply::Error(ModelError::ServerError { status: 500, body: "3".into() }),
            MockReply::reply("recovered"),
        ]);

        let config = ReliableConfig {
            max_retries: 0,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_millis(50),
            ..fast_config()
        };
        let reliable = ReliableModel::new(mock, config);
        let ctx = PromptContext::empty();

        for _ in 0..3 {
            let _ = reliable.propose(&ctx).await;
        }
        assert_eq!(reliable.circuit_state_name(), "open");

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = reliable.propose(&ctx).await;
        assert!(result.is_ok());
        assert_eq!(reliable.circuit_state_name(), "closed");
    }

    #[test]
    fn retry_delay_respects_suggested() {
        let reliable = ReliableModel::with_defaults(MockModel::new(vec![]));
        let delay = reliable.retry_delay(0, Some(Duration::from_secs(5)));
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn retry_delay_exponential_backoff() {
        let config = ReliableConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let reliable = ReliableModel::new(MockModel::new(vec![]), config);

        assert_eq!(reliable.retry_delay(0, None).as_millis(), 100);
        assert_eq!(reliable.retry_delay(1, None).as_millis(), 200);
        assert_eq!(reliable.retry_delay(2, None).as_millis(), 400);
    }

    #[test]
    fn retry_delay_capped_at_max() {
        let config = ReliableConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let reliable = ReliableModel::new(MockModel::new(vec![]), config);
        assert_eq!(reliable.retry_delay(10, None).as_millis(), 5000);
    }

    #[test]
    fn config_default_is_single_retry() {
        let config = ReliableConfig::default();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.circuit_breaker_threshold, 3);
    }

    #[test]
    fn provider_delegates_properties() {
        let reliable = ReliableModel::with_defaults(MockModel::new(vec![]));
        assert_eq!(reliable.name(), "mock");
        assert_eq!(reliable.model(), "mock-model");
    }
}
