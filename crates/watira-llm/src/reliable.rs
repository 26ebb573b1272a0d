//! Retry and circuit breaking around a [`ModelProvider`].
//!
//! Only opening the stream is retried; once events flow the caller owns
//! the outcome. Gemini signals quota pressure with 429s carrying a
//! `RetryInfo` delay. Short delays are honoured, while a delay beyond
//! [`ReliableConfig::max_rate_limit_wait`] means the quota is spent and the
//! call fails at once. Rate limits and malformed requests say nothing about
//! upstream health and never move the breaker.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use watira_core::context::ModelContext;
use watira_core::errors::GatewayError;
use watira_core::provider::{GenerateOptions, ModelProvider, ProviderHealth, ProviderStream};

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    /// Longest server-requested wait worth sitting through.
    pub max_rate_limit_wait: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            max_rate_limit_wait: Duration::from_secs(60),
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Circuit {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed. One trial request is let through at a time.
    HalfOpen { trial_in_flight: bool },
}

/// Whether an upstream failure says the provider itself is unwell.
fn counts_against_circuit(error: &GatewayError) -> bool {
    matches!(
        error,
        GatewayError::ServerError { .. }
            | GatewayError::Unavailable
            | GatewayError::NetworkError(_)
            | GatewayError::StreamInterrupted(_)
            | GatewayError::Timeout(_)
            | GatewayError::AuthenticationFailed(_)
    )
}

struct Breaker {
    circuit: Mutex<Circuit>,
    failures: AtomicU32,
    threshold: u32,
    cooldown: Duration,
}

impl Breaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            circuit: Mutex::new(Circuit::Closed),
            failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn admit(&self) -> Result<(), GatewayError> {
        let mut circuit = self.circuit.lock();
        match *circuit {
            Circuit::Closed => Ok(()),
            Circuit::Open { until } if Instant::now() < until => Err(GatewayError::Unavailable),
            Circuit::Open { .. } | Circuit::HalfOpen { trial_in_flight: false } => {
                debug!("circuit half-open, admitting trial request");
                *circuit = Circuit::HalfOpen { trial_in_flight: true };
                Ok(())
            }
            Circuit::HalfOpen { trial_in_flight: true } => Err(GatewayError::Unavailable),
        }
    }

    fn is_open(&self) -> bool {
        matches!(*self.circuit.lock(), Circuit::Open { until } if Instant::now() < until)
    }

    fn on_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        let mut circuit = self.circuit.lock();
        if *circuit != Circuit::Closed {
            info!("model circuit closed");
            *circuit = Circuit::Closed;
        }
    }

    fn on_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut circuit = self.circuit.lock();
        let trip = match *circuit {
            Circuit::HalfOpen { .. } => true,
            Circuit::Closed => failures >= self.threshold,
            Circuit::Open { .. } => false,
        };
        if trip {
            warn!(
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "model circuit opened"
            );
            *circuit = Circuit::Open {
                until: Instant::now() + self.cooldown,
            };
        }
    }

    /// A call ended without evidence either way; free the trial slot.
    fn on_neutral(&self) {
        let mut circuit = self.circuit.lock();
        if *circuit == (Circuit::HalfOpen { trial_in_flight: true }) {
            *circuit = Circuit::HalfOpen { trial_in_flight: false };
        }
    }

    fn snapshot(&self) -> (&'static str, Option<u64>) {
        match *self.circuit.lock() {
            Circuit::Closed => ("closed", None),
            Circuit::Open { until } => {
                let left = until.saturating_duration_since(Instant::now());
                ("open", Some(left.as_secs()))
            }
            Circuit::HalfOpen { .. } => ("half_open", None),
        }
    }
}

/// Wraps a provider with bounded retries and a circuit breaker.
pub struct ReliableProvider<P: ModelProvider> {
    inner: P,
    config: ReliableConfig,
    breaker: Breaker,
    retries: AtomicU64,
}

impl<P: ModelProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        let breaker = Breaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
        );
        Self {
            inner,
            config,
            breaker,
            retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    /// Exponential backoff with symmetric jitter, floored at 100ms.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let spread = capped * self.config.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(100.0) as u64)
    }

    /// How long to wait before the next attempt, or `None` to give up.
    fn next_delay(&self, attempt: u32, error: &GatewayError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.config.max_retries {
            return None;
        }
        match error.suggested_delay() {
            Some(wait) if wait > self.config.max_rate_limit_wait => {
                warn!(wait_secs = wait.as_secs(), "model quota exhausted, not retrying");
                None
            }
            Some(wait) => Some(wait),
            None => Some(self.backoff(attempt)),
        }
    }

    fn settle(&self, error: &GatewayError) {
        if counts_against_circuit(error) {
            self.breaker.on_failure();
        } else {
            self.breaker.on_neutral();
        }
    }
}

#[async_trait]
impl<P: ModelProvider> ModelProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn stream(
        &self,
        context: &ModelContext,
        options: &GenerateOptions,
    ) -> Result<ProviderStream, GatewayError> {
        self.breaker.admit()?;

        let mut attempt = 0;
        loop {
            let error = match self.inner.stream(context, options).await {
                Ok(stream) => {
                    self.breaker.on_success();
                    return Ok(stream);
                }
                Err(e) => e,
            };

            let Some(delay) = self.next_delay(attempt, &error) else {
                self.settle(&error);
                return Err(error);
            };
            self.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = error.error_kind(),
                "retrying model request"
            );
            tokio::time::sleep(delay).await;

            // Another caller may have tripped the breaker while we slept.
            if self.breaker.is_open() {
                return Err(GatewayError::Unavailable);
            }
            attempt += 1;
        }
    }

    fn health(&self) -> Option<ProviderHealth> {
        let (circuit, reopens_in_secs) = self.breaker.snapshot();
        Some(ProviderHealth {
            circuit,
            consecutive_failures: self.breaker.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reopens_in_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockResponse};

    fn server_error() -> MockResponse {
        MockResponse::Error(GatewayError::ServerError {
            status: 500,
            body: "internal".into(),
        })
    }

    fn fast(threshold: u32, cooldown: Duration) -> ReliableConfig {
        ReliableConfig {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            circuit_breaker_threshold: threshold,
            circuit_breaker_cooldown: cooldown,
            ..Default::default()
        }
    }

    async fn open(reliable: &ReliableProvider<MockProvider>) -> Result<(), GatewayError> {
        reliable
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await
            .map(|_| ())
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_server_errors() {
        let mock = MockProvider::new(vec![
            server_error(),
            server_error(),
            MockResponse::stream_text("recovered"),
        ]);
        let reliable = ReliableProvider::with_defaults(mock);

        assert!(open(&reliable).await.is_ok());
        let health = reliable.health().unwrap();
        assert_eq!(health.retries, 2);
        assert_eq!(health.circuit, "closed");
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn malformed_request_is_neither_retried_nor_counted() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::InvalidRequest("bad schema".into())),
            MockResponse::stream_text("unreachable"),
        ]);
        let reliable = ReliableProvider::with_defaults(mock);

        let err = open(&reliable).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(reliable.inner.call_count(), 1);
        assert_eq!(reliable.health().unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_retry_info_is_honoured() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            }),
            MockResponse::stream_text("ok"),
        ]);
        let reliable = ReliableProvider::with_defaults(mock);

        let started = Instant::now();
        assert!(open(&reliable).await.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert_eq!(reliable.inner.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_fails_fast_without_tripping() {
        let mock = MockProvider::new(vec![
            MockResponse::Error(GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            }),
            MockResponse::stream_text("unreachable"),
        ]);
        let config = ReliableConfig {
            max_retries: 3,
            ..fast(1, Duration::from_secs(60))
        };
        let reliable = ReliableProvider::new(mock, config);

        let err = open(&reliable).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(reliable.inner.call_count(), 1);
        assert_eq!(reliable.health().unwrap().circuit, "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_calling_upstream() {
        let mock = MockProvider::new(vec![
            server_error(),
            server_error(),
            server_error(),
            MockResponse::stream_text("unreachable"),
        ]);
        let reliable = ReliableProvider::new(mock, fast(3, Duration::from_secs(60)));

        for _ in 0..3 {
            assert!(open(&reliable).await.is_err());
        }
        let health = reliable.health().unwrap();
        assert_eq!(health.circuit, "open");
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.reopens_in_secs, Some(60));

        assert!(matches!(open(&reliable).await, Err(GatewayError::Unavailable)));
        assert_eq!(reliable.inner.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_immediately() {
        let mock = MockProvider::new(vec![
            server_error(),
            server_error(),
            MockResponse::stream_text("recovered"),
        ]);
        let reliable = ReliableProvider::new(mock, fast(1, Duration::from_secs(30)));

        assert!(open(&reliable).await.is_err());
        assert_eq!(reliable.health().unwrap().circuit, "open");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(open(&reliable).await.is_err());
        assert_eq!(reliable.health().unwrap().circuit, "open");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(open(&reliable).await.is_ok());
        assert_eq!(reliable.health().unwrap().circuit, "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_lets_one_request_through() {
        let mock = MockProvider::new(vec![
            server_error(),
            MockResponse::delayed(Duration::from_secs(1), MockResponse::stream_text("trial")),
            MockResponse::stream_text("unreachable"),
        ]);
        let reliable = ReliableProvider::new(mock, fast(1, Duration::from_secs(10)));
        assert!(open(&reliable).await.is_err());
        tokio::time::sleep(Duration::from_secs(11)).await;

        let (first, second) = tokio::join!(open(&reliable), async {
            tokio::task::yield_now().await;
            open(&reliable).await
        });
        assert!(first.is_ok());
        assert!(matches!(second, Err(GatewayError::Unavailable)));
        assert_eq!(reliable.inner.call_count(), 2);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = ReliableConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let reliable = ReliableProvider::new(MockProvider::new(vec![]), config);
        let delays: Vec<u128> = (0..5).map(|a| reliable.backoff(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn jitter_stays_within_range() {
        let reliable = ReliableProvider::new(
            MockProvider::new(vec![]),
            ReliableConfig {
                base_delay: Duration::from_millis(1000),
                jitter_factor: 0.2,
                ..Default::default()
            },
        );
        for _ in 0..50 {
            let d = reliable.backoff(0).as_millis();
            assert!((800..=1200).contains(&d), "delay out of range: {d}");
        }
    }
}
