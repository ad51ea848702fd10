//! Periodic liveness probing for one connection.
//!
//! The monitor drives a probe on a fixed interval (after a grace period)
//! and turns the stream of outcomes into edge-triggered events: `healthy`
//! on the first success, `degraded` on the first failure of a run,
//! `unhealthy` when the consecutive-failure threshold is crossed, and
//! `recovered` on the first success after unhealthy. Listeners run
//! serially; a panicking listener is logged and swallowed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Health probing configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
    /// Delay before the first probe, so freshly started servers settle.
    pub grace_period: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
            grace_period: Duration::from_secs(1),
        }
    }
}

/// Edge-triggered health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    Healthy,
    Degraded,
    Unhealthy,
    Recovered,
}

/// Point-in-time view of a monitor.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub checks_run: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct MonitorState {
    snapshot: HealthSnapshot,
    had_success: bool,
    in_failure_run: bool,
    was_unhealthy: bool,
}

type Listener = Box<dyn Fn(&str, HealthEvent) + Send + Sync>;

/// Liveness probe driver for one connection.
pub struct HealthMonitor {
    server: String,
    config: HealthConfig,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<Listener>>,
}

impl HealthMonitor {
    pub fn new(server: &str, config: HealthConfig) -> Self {
        Self {
            server: server.to_string(),
            config,
            state: Mutex::new(MonitorState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register a listener for health transitions.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&str, HealthEvent) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(listener));
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .snapshot
            .clone()
    }

    /// Fold one probe outcome into the state machine, returning the event
    /// it triggers, if any.
    pub fn record_result(&self, result: Result<(), String>) -> Option<HealthEvent> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.snapshot.checks_run += 1;
        match result {
            Ok(()) => {
                state.snapshot.consecutive_failures = 0;
                state.snapshot.is_healthy = true;
                state.snapshot.last_error = None;
                state.in_failure_run = false;
                if state.was_unhealthy {
                    state.was_unhealthy = false;
                    state.had_success = true;
                    Some(HealthEvent::Recovered)
                } else if !state.had_success {
                    state.had_success = true;
                    Some(HealthEvent::Healthy)
                } else {
                    None
                }
            }
            Err(error) => {
                state.snapshot.consecutive_failures += 1;
                state.snapshot.last_error = Some(error);
                let first_in_run = !state.in_failure_run;
                state.in_failure_run = true;
                if state.snapshot.consecutive_failures == self.config.max_consecutive_failures {
                    state.snapshot.is_healthy = false;
                    state.was_unhealthy = true;
                    Some(HealthEvent::Unhealthy)
                } else if first_in_run {
                    Some(HealthEvent::Degraded)
                } else {
                    None
                }
            }
        }
    }

    /// Invoke listeners serially. A listener panic is logged and swallowed.
    fn emit(&self, event: HealthEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        for listener in listeners.iter() {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener(&self.server, event)));
            if outcome.is_err() {
                tracing::error!(server = %self.server, ?event, "health listener panicked");
            }
        }
    }

    /// Drive the probe loop until cancelled.
    ///
    /// Each probe races the configured timeout; timing out counts as a
    /// failure like any other.
    pub async fn run<F, Fut>(self: Arc<Self>, probe: F, cancel: CancellationToken)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = crate::Result<()>> + Send,
    {
        if !self.config.enabled {
            tracing::debug!(server = %self.server, "health monitoring disabled");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.config.grace_period) => {}
            _ = cancel.cancelled() => return,
        }

        loop {
            let outcome = match tokio::time::timeout(self.config.timeout, probe()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_elapsed) => Err(format!(
                    "health check timed out after {}ms",
                    self.config.timeout.as_millis()
                )),
            };

            if let Err(error) = &outcome {
                tracing::debug!(server = %self.server, error = %error, "health check failed");
            }
            if let Some(event) = self.record_result(outcome) {
                tracing::info!(server = %self.server, ?event, "health transition");
                self.emit(event);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}
