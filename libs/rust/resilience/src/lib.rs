//! Resilience utilities: filtered retry with backoff + circuit breaker.
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use tracing::{warn, debug};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

static RETRY_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("valuation_resilience_retry_attempts_total", "Total retry attempts executed")
        .expect("register retry counter")
});

static BREAKER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("valuation_resilience_breaker_transitions_total", "Circuit breaker state transitions", &["breaker", "to"])
        .expect("register breaker counter")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit '{0}' open")]
    CircuitOpen(String),
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(20), max_delay: Duration::from_millis(500), jitter: 0.25 } } }

impl RetryConfig {
    pub fn none() -> Self { Self { max_retries: 0, ..Self::default() } }

    /// Exponential backoff for `attempt` (0-based), capped at `max_delay`, with symmetric jitter.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(16) as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter.min(1.0)) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Retry only errors for which `should_retry` holds; anything else returns immediately.
pub async fn retry_if<F, Fut, T, E, P>(cfg: &RetryConfig, mut op: F, should_retry: P) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !should_retry(&e) => return Err(e),
            Err(_) => {
                let delay = cfg.delay_for(attempt);
                RETRY_ATTEMPTS.inc();
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState { Closed, Open, HalfOpen }

/// Consecutive-failure breaker. Once open it rejects calls until `half_open_after`
/// elapses, then lets a single trial through.
pub struct CircuitBreaker {
    name: String,
    state: Mutex<State>,
    half_open_after: Duration,
    failure_threshold: u32,
}

struct State { failures: u32, opened_at: Option<Instant>, trial_in_flight: bool }

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, half_open_after: Duration) -> Self {
        Self { name: name.into(), state: Mutex::new(State { failures: 0, opened_at: None, trial_in_flight: false }), half_open_after, failure_threshold: failure_threshold.max(1) }
    }

    pub fn state(&self) -> BreakerState {
        let st = self.state.lock();
        match st.opened_at {
            None => BreakerState::Closed,
            Some(opened) if opened.elapsed() >= self.half_open_after => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    pub fn allow(&self) -> Result<(), ResilienceError> {
        let mut st = self.state.lock();
        if let Some(opened) = st.opened_at {
            if opened.elapsed() < self.half_open_after || st.trial_in_flight {
                return Err(ResilienceError::CircuitOpen(self.name.clone()));
            }
            debug!(breaker = %self.name, "half-open trial");
            st.trial_in_flight = true;
            BREAKER_TRANSITIONS.with_label_values(&[&self.name, "half_open"]).inc();
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut st = self.state.lock();
        if st.opened_at.is_some() {
            BREAKER_TRANSITIONS.with_label_values(&[&self.name, "closed"]).inc();
        }
        st.failures = 0;
        st.opened_at = None;
        st.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.failures += 1;
        let trial_failed = st.trial_in_flight;
        st.trial_in_flight = false;
        if trial_failed || (st.opened_at.is_none() && st.failures >= self.failure_threshold) {
            st.opened_at = Some(Instant::now());
            BREAKER_TRANSITIONS.with_label_values(&[&self.name, "open"]).inc();
            warn!(breaker = %self.name, failures = st.failures, "circuit opened");
        }
    }
}
