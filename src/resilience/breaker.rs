//! Circuit breaker guarding a single server connection.
//!
//! Closed admits calls and counts outcomes in a time-bounded rolling
//! window; enough consecutive failures over enough observed operations
//! trip it open. Open fast-fails everything until the reset timeout
//! elapses, then the next admitted call probes in half-open. Half-open
//! needs `success_threshold` consecutive successes to close; a single
//! failure re-opens.
//!
//! Access is serialized by the owning connection — the lock below protects
//! state, not concurrency of `execute`, and is never held across an await.

use crate::error::FleetError;
use crate::resilience::{Clock, MonotonicClock};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Observable breaker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    HalfOpened,
    Closed,
}

/// Breaker tuning. Defaults: 5 failures / 60 s reset / 30 s op timeout /
/// 2 half-open successes / 60 s window / 5 minimum operations.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub operation_timeout: Duration,
    pub success_threshold: u32,
    pub rolling_window: Duration,
    pub minimum_operations: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(30),
            success_threshold: 2,
            rolling_window: Duration::from_secs(60),
            minimum_operations: 5,
        }
    }
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct BreakerStats {
    pub phase_is_open: bool,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub failures: u64,
    pub fast_failures: u64,
    pub times_opened: u64,
    pub last_transition_millis: Option<u64>,
}

/// Time-bounded buffer of call outcomes backing the trip decision.
struct RollingWindow {
    entries: VecDeque<(u64, bool)>,
    duration_millis: u64,
}

impl RollingWindow {
    fn new(duration: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            duration_millis: duration.as_millis() as u64,
        }
    }

    fn record(&mut self, now: u64, ok: bool) {
        self.entries.push_back((now, ok));
        self.prune(now);
    }

    fn prune(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.duration_millis);
        while let Some((ts, _)) = self.entries.front() {
            if *ts < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct BreakerInner {
    phase: BreakerPhase,
    consecutive_failures: u32,
    successes_in_half_open: u32,
    opened_at: u64,
    window: RollingWindow,
    stats: BreakerStats,
}

type EventListener = Box<dyn Fn(BreakerEvent) + Send + Sync>;

/// Circuit breaker for one connection's outbound operations.
pub struct CircuitBreaker {
    server: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    listener: Mutex<Option<EventListener>>,
}

impl CircuitBreaker {
    pub fn new(server: &str, config: BreakerConfig) -> Self {
        let window = RollingWindow::new(config.rolling_window);
        Self {
            server: server.to_string(),
            config,
            clock: Arc::new(MonotonicClock::default()),
            inner: Mutex::new(BreakerInner {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                successes_in_half_open: 0,
                opened_at: 0,
                window,
                stats: BreakerStats::default(),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register the transition listener. At most one; replaces any previous.
    pub fn on_transition<F>(&self, listener: F)
    where
        F: Fn(BreakerEvent) + Send + Sync + 'static,
    {
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(Box::new(listener));
    }

    pub fn phase(&self) -> BreakerPhase {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).phase
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut stats = inner.stats.clone();
        stats.phase_is_open = inner.phase == BreakerPhase::Open;
        stats.consecutive_failures = inner.consecutive_failures;
        stats
    }

    /// Run one operation under the breaker, bounded by the per-call
    /// operation timeout. Fails fast with `CircuitOpen` while open.
    pub async fn execute<T, Fut, Op>(&self, op: Op) -> crate::Result<T>
    where
        Fut: Future<Output = crate::Result<T>>,
        Op: FnOnce() -> Fut,
    {
        self.admit()?;

        let result = match tokio::time::timeout(self.config.operation_timeout, op()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(FleetError::TimeoutExceeded(
                self.server.clone(),
                self.config.operation_timeout.as_millis() as u64,
            )),
        };

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result
    }

    /// Admission check: open fast-fails until the reset timeout elapses,
    /// then transitions to half-open for the probing call.
    fn admit(&self) -> crate::Result<()> {
        let now = self.clock.now_millis();
        let mut event = None;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.phase == BreakerPhase::Open {
                let elapsed = now.saturating_sub(inner.opened_at);
                if elapsed < self.config.reset_timeout.as_millis() as u64 {
                    inner.stats.fast_failures += 1;
                    return Err(FleetError::CircuitOpen(self.server.clone()));
                }
                inner.phase = BreakerPhase::HalfOpen;
                inner.successes_in_half_open = 0;
                inner.stats.last_transition_millis = Some(now);
                event = Some(BreakerEvent::HalfOpened);
            }
        }
        if let Some(event) = event {
            tracing::info!(server = %self.server, "circuit breaker half-open");
            self.emit(event);
        }
        Ok(())
    }

    fn on_success(&self) {
        let now = self.clock.now_millis();
        let mut event = None;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.stats.successes += 1;
            match inner.phase {
                BreakerPhase::Closed => {
                    inner.consecutive_failures = 0;
                    inner.window.record(now, true);
                }
                BreakerPhase::HalfOpen => {
                    inner.successes_in_half_open += 1;
                    if inner.successes_in_half_open >= self.config.success_threshold {
                        inner.phase = BreakerPhase::Closed;
                        inner.consecutive_failures = 0;
                        inner.successes_in_half_open = 0;
                        inner.window = RollingWindow::new(self.config.rolling_window);
                        inner.stats.last_transition_millis = Some(now);
                        event = Some(BreakerEvent::Closed);
                    }
                }
                BreakerPhase::Open => {}
            }
        }
        if let Some(event) = event {
            tracing::info!(server = %self.server, "circuit breaker closed");
            self.emit(event);
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        let mut event = None;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.stats.failures += 1;
            match inner.phase {
                BreakerPhase::Closed => {
                    inner.consecutive_failures += 1;
                    inner.window.record(now, false);
                    if inner.consecutive_failures >= self.config.failure_threshold
                        && inner.window.len() >= self.config.minimum_operations
                    {
                        inner.phase = BreakerPhase::Open;
                        inner.opened_at = now;
                        inner.stats.times_opened += 1;
                        inner.stats.last_transition_millis = Some(now);
                        event = Some(BreakerEvent::Opened);
                    }
                }
                BreakerPhase::HalfOpen => {
                    inner.phase = BreakerPhase::Open;
                    inner.opened_at = now;
                    inner.stats.times_opened += 1;
                    inner.stats.last_transition_millis = Some(now);
                    event = Some(BreakerEvent::Opened);
                }
                BreakerPhase::Open => {}
            }
        }
        if let Some(event) = event {
            tracing::warn!(server = %self.server, "circuit breaker opened");
            self.emit(event);
        }
    }

    fn emit(&self, event: BreakerEvent) {
        if let Some(listener) = self.listener.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            listener(event);
        }
    }
}
