//! Retry strategy with backoff, jitter, and attempt/wall-time budgets.

use crate::error::FleetError;
use crate::resilience::{Clock, MonotonicClock, Sleeper, TokioSleeper};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How the base delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay every attempt
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay multiplies by `backoff_multiplier` each attempt
    Exponential,
}

/// Retry tuning for one connection.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub strategy: BackoffStrategy,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Jitter factor in [0, 1]: each delay is scaled by a uniform sample
    /// from `1 - jitter ..= 1 + jitter`.
    pub jitter: f64,
    pub max_total_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            max_total_time: Duration::from_millis(120_000),
        }
    }
}

/// Retries a supplied operation until success or budget exhaustion.
///
/// Attempts are strictly sequential; errors classified non-retryable stop
/// the loop immediately and propagate unchanged.
pub struct RetryStrategy {
    server: String,
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl RetryStrategy {
    pub fn new(server: &str, config: RetryConfig) -> Self {
        Self {
            server: server.to_string(),
            config,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Base delay for a 1-indexed attempt, before jitter and capping.
    fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay;
        match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.checked_mul(attempt).unwrap_or(Duration::MAX),
            BackoffStrategy::Exponential => {
                let factor = self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
                base.mul_f64(factor.min(1e9))
            }
        }
    }

    /// Full delay formula: strategy base, jitter band, then the cap.
    pub(crate) fn delay_for_attempt<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let scale = if jitter == 0.0 {
            1.0
        } else {
            rng.random_range(1.0 - jitter..=1.0 + jitter)
        };
        base.mul_f64(scale).min(self.config.max_delay)
    }

    /// Run `op` with retries. The final error is the last attempt's error.
    pub async fn execute<T, Fut, Op>(&self, mut op: Op) -> crate::Result<T>
    where
        Fut: Future<Output = crate::Result<T>>,
        Op: FnMut() -> Fut,
    {
        let started = self.clock.now_millis();
        let budget_millis = self.config.max_total_time.as_millis() as u64;
        let mut attempt: u32 = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= self.config.max_attempts {
                        tracing::warn!(
                            server = %self.server,
                            attempts = attempt,
                            error = %e,
                            "retry budget exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt, &mut rand::rng());
                    let elapsed = self.clock.now_millis().saturating_sub(started);
                    if elapsed + delay.as_millis() as u64 > budget_millis {
                        tracing::warn!(
                            server = %self.server,
                            elapsed_ms = elapsed,
                            error = %e,
                            "retry wall-time budget exhausted"
                        );
                        return Err(e);
                    }

                    tracing::debug!(
                        server = %self.server,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after delay"
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
