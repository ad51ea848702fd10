//! Fleet supervisor — owns every connection record and its background tasks.
//!
//! The manager keeps one record per server name under an async lock,
//! enforces the concurrency cap, runs per-connection lifecycle and
//! health-monitor tasks in a task tracker, coordinates recovery when a
//! monitor reports unhealthy, and performs idempotent fleet-wide shutdown
//! bounded by the shutdown timeout.

use crate::config::{ConnectionMode, FleetConfig, ServerDescriptor};
use crate::connection::ServerConnection;
use crate::error::FleetError;
use crate::events::{EventSink, FleetEvent};
use crate::health::{HealthConfig, HealthEvent};
use crate::resilience::{BreakerConfig, RetryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Fleet-level tuning.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub max_concurrent_connections: usize,
    pub auto_recovery: bool,
    pub max_recovery_attempts: u32,
    pub recovery_delay: Duration,
    pub recovery_backoff_multiplier: f64,
    pub shutdown_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 20,
            auto_recovery: true,
            max_recovery_attempts: 3,
            recovery_delay: Duration::from_secs(1),
            recovery_backoff_multiplier: 2.0,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-connection resilience tuning, shared by every connection the
/// manager constructs.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
}

/// Manager-side view of one connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Initializing,
    Running,
    Recovering,
    ShuttingDown,
    Shutdown,
    Failed,
}

/// One managed server, keyed by name in the fleet map.
pub struct ConnectionRecord {
    pub descriptor: ServerDescriptor,
    pub state: RecordState,
    pub connection: Arc<ServerConnection>,
    pub started_at: Instant,
    pub last_state_change: Instant,
    pub error_count: u32,
    pub last_error: Option<String>,
    recovery_in_flight: bool,
}

/// Summary row for the management surface.
#[derive(Debug, Clone)]
pub struct ServerSummary {
    pub name: String,
    pub state: RecordState,
    pub healthy: bool,
    pub uptime: Duration,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Fleet counters for the management surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct FleetCounts {
    pub total: usize,
    pub connected: usize,
    pub failed: usize,
}

/// The fleet supervisor.
pub struct LifecycleManager {
    config: LifecycleConfig,
    settings: ConnectionSettings,
    records: Mutex<HashMap<String, ConnectionRecord>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    shutdown_complete: CancellationToken,
    sink: Arc<dyn EventSink>,
    recovery_tx: mpsc::UnboundedSender<String>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        settings: ConnectionSettings,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            settings,
            records: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            shutdown_complete: CancellationToken::new(),
            sink,
            recovery_tx,
        });

        let dispatcher = manager.clone();
        manager
            .tracker
            .spawn(dispatcher.recovery_dispatcher(recovery_rx));

        manager
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Start every enabled server from the config.
    ///
    /// `strict` servers propagate their startup failure; `lenient` servers
    /// are logged and left to recovery.
    pub async fn start_all(self: &Arc<Self>, config: &FleetConfig) -> crate::Result<()> {
        config.validate()?;
        for descriptor in config.enabled_servers() {
            match self.start_connection(descriptor.clone()).await {
                Ok(_) => {}
                Err(e) if descriptor.connection_mode == ConnectionMode::Strict => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        server = %descriptor.name,
                        error = %e,
                        "lenient server failed to start, leaving it to recovery"
                    );
                }
            }
        }
        Ok(())
    }

    /// Start (or return) the connection for one server.
    pub async fn start_connection(
        self: &Arc<Self>,
        descriptor: ServerDescriptor,
    ) -> crate::Result<Arc<ServerConnection>> {
        if self.is_shutting_down() {
            return Err(FleetError::ShuttingDown("fleet".to_string()));
        }
        descriptor.validate()?;
        let name = descriptor.name.clone();

        // Register the record under the fleet lock.
        let connection = {
            let mut records = self.records.lock().await;

            if let Some(existing) = records.get(&name) {
                if existing.state != RecordState::Failed {
                    return Ok(existing.connection.clone());
                }
                // A failed record is cleaned up before being replaced.
                if let Some(old) = records.remove(&name) {
                    old.connection.request_shutdown();
                }
            }

            let active = records
                .values()
                .filter(|r| !matches!(r.state, RecordState::Shutdown | RecordState::Failed))
                .count();
            if active >= self.config.max_concurrent_connections {
                return Err(FleetError::ConfigInvalid(
                    name,
                    format!(
                        "connection limit of {} reached",
                        self.config.max_concurrent_connections
                    ),
                ));
            }

            let connection = ServerConnection::new(
                descriptor.clone(),
                self.settings.breaker.clone(),
                self.settings.retry.clone(),
                self.settings.health.clone(),
            );
            records.insert(
                name.clone(),
                ConnectionRecord {
                    descriptor,
                    state: RecordState::Initializing,
                    connection: connection.clone(),
                    started_at: Instant::now(),
                    last_state_change: Instant::now(),
                    error_count: 0,
                    last_error: None,
                    recovery_in_flight: false,
                },
            );
            connection
        };

        // Unhealthy reports feed the recovery queue.
        let monitor = connection.monitor();
        {
            let sink = self.sink.clone();
            let recovery_tx = self.recovery_tx.clone();
            monitor.on_event(move |server, event| {
                if event == HealthEvent::Unhealthy {
                    sink.fleet_event(FleetEvent::Unhealthy {
                        server: server.to_string(),
                    });
                    let _ = recovery_tx.send(server.to_string());
                }
            });
        }

        // Lifecycle task: initialize, report the outcome, then hold until shutdown.
        let (init_tx, init_rx) = oneshot::channel();
        let conn_for_lifecycle = connection.clone();
        self.tracker.spawn(async move {
            let result = conn_for_lifecycle.initialize().await;
            let _ = init_tx.send(result);
            conn_for_lifecycle.wait_for_shutdown().await;
        });

        // Health-monitor task, stopped by fleet cancel or connection shutdown.
        let monitor_cancel = self.cancel.child_token();
        let stop_cancel = monitor_cancel.clone();
        let conn_for_stop = connection.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = conn_for_stop.wait_for_shutdown() => stop_cancel.cancel(),
                _ = stop_cancel.cancelled() => {}
            }
        });
        let conn_for_probe = connection.clone();
        self.tracker.spawn(monitor.run(
            move || {
                let conn = conn_for_probe.clone();
                async move { conn.perform_health_check().await }
            },
            monitor_cancel,
        ));

        // Await the initialization outcome.
        match init_rx.await {
            Ok(Ok(())) => {
                self.set_record_state(&name, RecordState::Running).await;
                self.sink.fleet_event(FleetEvent::ConnectionReady {
                    server: name.clone(),
                });
                Ok(connection)
            }
            Ok(Err(e)) => {
                let recoverable = e.is_retryable() && self.config.auto_recovery;
                {
                    let mut records = self.records.lock().await;
                    if let Some(record) = records.get_mut(&name) {
                        record.error_count += 1;
                        record.last_error = Some(e.to_string());
                        record.state = if recoverable {
                            RecordState::Recovering
                        } else {
                            RecordState::Failed
                        };
                        record.last_state_change = Instant::now();
                    }
                }
                if recoverable {
                    let _ = self.recovery_tx.send(name.clone());
                } else {
                    self.sink.fleet_event(FleetEvent::ConnectionFailed {
                        server: name.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
            Err(_task_gone) => Err(FleetError::ShuttingDown("fleet".to_string())),
        }
    }

    /// The connection for `name`, only while running and healthy.
    pub async fn get_connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        let records = self.records.lock().await;
        records.get(name).and_then(|record| {
            (record.state == RecordState::Running && record.connection.is_healthy())
                .then(|| record.connection.clone())
        })
    }

    /// All connections currently running and healthy, with their names.
    pub async fn running_connections(&self) -> Vec<(String, Arc<ServerConnection>)> {
        let records = self.records.lock().await;
        let mut out: Vec<(String, Arc<ServerConnection>)> = records
            .iter()
            .filter(|(_, r)| r.state == RecordState::Running && r.connection.is_healthy())
            .map(|(name, r)| (name.clone(), r.connection.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Stop one server and remove its record.
    pub async fn stop_connection(&self, name: &str) -> crate::Result<()> {
        let connection = {
            let mut records = self.records.lock().await;
            let record = records.get_mut(name).ok_or_else(|| {
                FleetError::ConnectionLost(name.to_string(), "no such server".to_string())
            })?;
            record.state = RecordState::ShuttingDown;
            record.last_state_change = Instant::now();
            record.connection.clone()
        };

        connection.request_shutdown();
        if tokio::time::timeout(self.config.shutdown_timeout, connection.wait_for_shutdown())
            .await
            .is_err()
        {
            tracing::warn!(server = %name, "connection shutdown exceeded timeout");
        }

        self.records.lock().await.remove(name);
        self.sink.fleet_event(FleetEvent::ConnectionShutdown {
            server: name.to_string(),
        });
        Ok(())
    }

    /// Idempotent fleet-wide teardown bounded by the shutdown timeout.
    ///
    /// Concurrent callers all complete against the same latch; records are
    /// disposed exactly once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            self.shutdown_complete.cancelled().await;
            return;
        }

        tracing::info!("fleet shutting down");
        let connections: Vec<Arc<ServerConnection>> = {
            let records = self.records.lock().await;
            records.values().map(|r| r.connection.clone()).collect()
        };

        for connection in &connections {
            connection.request_shutdown();
        }
        let all_down =
            futures::future::join_all(connections.iter().map(|c| c.wait_for_shutdown()));
        if tokio::time::timeout(self.config.shutdown_timeout, all_down)
            .await
            .is_err()
        {
            tracing::warn!("some connections exceeded the shutdown timeout; abandoning them");
        }

        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("background tasks exceeded the shutdown timeout");
        }

        self.records.lock().await.clear();
        for connection in &connections {
            self.sink.fleet_event(FleetEvent::ConnectionShutdown {
                server: connection.name().to_string(),
            });
        }
        self.shutdown_complete.cancel();
        tracing::info!("fleet shutdown complete");
    }

    /// Summary rows for every record, sorted by name.
    pub async fn summaries(&self) -> Vec<ServerSummary> {
        let records = self.records.lock().await;
        let mut out: Vec<ServerSummary> = records
            .iter()
            .map(|(name, r)| ServerSummary {
                name: name.clone(),
                state: r.state,
                healthy: r.connection.is_healthy(),
                uptime: r.started_at.elapsed(),
                error_count: r.error_count,
                last_error: r.last_error.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn counts(&self) -> FleetCounts {
        let records = self.records.lock().await;
        FleetCounts {
            total: records.len(),
            connected: records
                .values()
                .filter(|r| r.state == RecordState::Running)
                .count(),
            failed: records
                .values()
                .filter(|r| r.state == RecordState::Failed)
                .count(),
        }
    }

    async fn set_record_state(&self, name: &str, state: RecordState) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(name) {
            record.state = state;
            record.last_state_change = Instant::now();
        }
    }

    /// Serializes recovery scheduling: one queue, one task per server at a time.
    async fn recovery_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        loop {
            tokio::select! {
                maybe_name = rx.recv() => {
                    let Some(name) = maybe_name else { break };
                    if self.is_shutting_down() {
                        continue;
                    }
                    let manager = self.clone();
                    self.tracker.spawn(manager.run_recovery(name));
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// Recovery loop for one server: bounded attempts with exponential
    /// spacing; success returns the record to running.
    async fn run_recovery(self: Arc<Self>, name: String) {
        // Claim the record; skip if another recovery is already on it.
        let connection = {
            let mut records = self.records.lock().await;
            match records.get_mut(&name) {
                Some(record)
                    if !record.recovery_in_flight
                        && record.state != RecordState::ShuttingDown
                        && record.state != RecordState::Shutdown =>
                {
                    record.recovery_in_flight = true;
                    record.state = RecordState::Recovering;
                    record.last_state_change = Instant::now();
                    record.connection.clone()
                }
                _ => return,
            }
        };

        let mut delay = self.config.recovery_delay;
        for attempt in 1..=self.config.max_recovery_attempts {
            self.sink.fleet_event(FleetEvent::RecoveryStarted {
                server: name.clone(),
                attempt,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.clear_recovery_flag(&name).await;
                    return;
                }
            }

            match connection.reinitialize().await {
                Ok(()) => {
                    if connection.perform_health_check().await.is_ok() {
                        {
                            let mut records = self.records.lock().await;
                            if let Some(record) = records.get_mut(&name) {
                                record.state = RecordState::Running;
                                record.last_state_change = Instant::now();
                                record.recovery_in_flight = false;
                            }
                        }
                        self.sink.fleet_event(FleetEvent::ConnectionRecovered {
                            server: name.clone(),
                        });
                        tracing::info!(server = %name, attempt, "connection recovered");
                        return;
                    }
                }
                Err(FleetError::ShuttingDown(_)) => {
                    self.clear_recovery_flag(&name).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(server = %name, attempt, error = %e, "recovery attempt failed");
                    let mut records = self.records.lock().await;
                    if let Some(record) = records.get_mut(&name) {
                        record.error_count += 1;
                        record.last_error = Some(e.to_string());
                    }
                }
            }

            delay = delay.mul_f64(self.config.recovery_backoff_multiplier);
        }

        {
            let mut records = self.records.lock().await;
            if let Some(record) = records.get_mut(&name) {
                record.state = RecordState::Failed;
                record.last_state_change = Instant::now();
                record.recovery_in_flight = false;
            }
        }
        self.sink.fleet_event(FleetEvent::RecoveryFailed {
            server: name.clone(),
            attempts: self.config.max_recovery_attempts,
        });
        tracing::error!(server = %name, "recovery exhausted, connection failed");
    }

    async fn clear_recovery_flag(&self, name: &str) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(name) {
            record.recovery_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::testutil::{FAKE_SERVER, broken_descriptor, fake_server_descriptor as fake_descriptor};

    fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            retry: RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
                jitter: 0.0,
                ..RetryConfig::default()
            },
            health: HealthConfig {
                interval: Duration::from_millis(200),
                grace_period: Duration::from_millis(50),
                ..HealthConfig::default()
            },
            ..ConnectionSettings::default()
        }
    }

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            recovery_delay: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..LifecycleConfig::default()
        }
    }

    fn manager(
        config: LifecycleConfig,
    ) -> (
        Arc<LifecycleManager>,
        tokio::sync::mpsc::UnboundedReceiver<FleetEvent>,
    ) {
        let (sink, fleet_rx, _tool_rx) = ChannelSink::new();
        let manager = LifecycleManager::new(config, fast_settings(), Arc::new(sink));
        (manager, fleet_rx)
    }

    #[tokio::test]
    async fn test_start_stop_start_leaves_no_stale_record() {
        let (manager, _events) = manager(fast_config());

        let first = manager
            .start_connection(fake_descriptor("echo"))
            .await
            .unwrap();
        assert!(manager.get_connection("echo").await.is_some());

        manager.stop_connection("echo").await.unwrap();
        assert!(manager.get_connection("echo").await.is_none());
        assert_eq!(manager.counts().await.total, 0);

        let second = manager
            .start_connection(fake_descriptor("echo"))
            .await
            .unwrap();
        assert!(
            !Arc::ptr_eq(&first, &second),
            "restart must produce a fresh connection"
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_returns_existing_connection() {
        let (manager, _events) = manager(fast_config());
        let first = manager
            .start_connection(fake_descriptor("echo"))
            .await
            .unwrap();
        let second = manager
            .start_connection(fake_descriptor("echo"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.counts().await.total, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_limit_enforced() {
        let (manager, _events) = manager(LifecycleConfig {
            max_concurrent_connections: 1,
            ..fast_config()
        });
        manager
            .start_connection(fake_descriptor("one"))
            .await
            .unwrap();
        let result = manager.start_connection(fake_descriptor("two")).await;
        assert!(
            matches!(result, Err(FleetError::ConfigInvalid(name, msg)) if name == "two" && msg.contains("limit"))
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_without_recovery_marks_failed() {
        let (manager, mut events) = manager(LifecycleConfig {
            auto_recovery: false,
            ..fast_config()
        });
        // Spawn failures are retryable, but auto-recovery is off.
        let result = manager.start_connection(broken_descriptor("ghost")).await;
        assert!(matches!(result, Err(FleetError::TransportUnavailable(_, _))));

        assert!(manager.get_connection("ghost").await.is_none());
        let summaries = manager.summaries().await;
        assert_eq!(summaries[0].state, RecordState::Failed);
        assert!(summaries[0].last_error.is_some());

        let event = events.recv().await.unwrap();
        assert!(matches!(event, FleetEvent::ConnectionFailed { server, .. } if server == "ghost"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_with_recovery_exhausts_and_fails() {
        let (manager, mut events) = manager(LifecycleConfig {
            max_recovery_attempts: 2,
            ..fast_config()
        });
        let result = manager.start_connection(broken_descriptor("ghost")).await;
        assert!(result.is_err());

        // recovery_started (1), recovery_started (2), recovery_failed
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.recv().await.unwrap());
        }
        assert_eq!(
            seen[0],
            FleetEvent::RecoveryStarted {
                server: "ghost".to_string(),
                attempt: 1
            }
        );
        assert_eq!(
            seen[1],
            FleetEvent::RecoveryStarted {
                server: "ghost".to_string(),
                attempt: 2
            }
        );
        assert_eq!(
            seen[2],
            FleetEvent::RecoveryFailed {
                server: "ghost".to_string(),
                attempts: 2
            }
        );
        let summaries = manager.summaries().await;
        assert_eq!(summaries[0].state, RecordState::Failed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_succeeds_when_server_comes_back() {
        // First spawn exits non-zero; every later spawn runs the fake
        // server. Initialization fails once, then recovery brings it up.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready");
        let script = format!(
            "if [ -f {marker} ]; then {FAKE_SERVER}; else touch {marker}; exit 1; fi",
            marker = marker.display()
        );
        let mut descriptor = ServerDescriptor::stdio("flaky", "sh");
        descriptor.args = vec!["-c".to_string(), script];
        descriptor.timeout_ms = 5_000;

        let (manager, mut events) = manager(fast_config());
        let result = manager.start_connection(descriptor).await;
        assert!(result.is_err(), "first start fails");

        let mut recovered = false;
        for _ in 0..4 {
            match events.recv().await.unwrap() {
                FleetEvent::ConnectionRecovered { server } => {
                    assert_eq!(server, "flaky");
                    recovered = true;
                    break;
                }
                FleetEvent::RecoveryStarted { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(recovered, "expected connection_recovered");
        assert!(manager.get_connection("flaky").await.is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_refused_while_shutting_down() {
        let (manager, _events) = manager(fast_config());
        manager.shutdown().await;
        let result = manager.start_connection(fake_descriptor("late")).await;
        assert!(matches!(result, Err(FleetError::ShuttingDown(_))));
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_is_idempotent() {
        let (manager, _events) = manager(fast_config());
        for name in ["a", "b", "c"] {
            manager
                .start_connection(fake_descriptor(name))
                .await
                .unwrap();
        }
        assert_eq!(manager.counts().await.connected, 3);

        let m1 = manager.clone();
        let m2 = manager.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { m1.shutdown().await }),
            tokio::spawn(async move { m2.shutdown().await }),
        );
        r1.unwrap();
        r2.unwrap();

        assert_eq!(manager.counts().await.total, 0);
        assert!(manager.tracker.is_closed());
        assert_eq!(manager.tracker.len(), 0, "no background tasks remain");
    }

    #[tokio::test]
    async fn test_stop_unknown_server_is_not_found() {
        let (manager, _events) = manager(fast_config());
        let result = manager.stop_connection("nope").await;
        assert!(matches!(result, Err(FleetError::ConnectionLost(name, _)) if name == "nope"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_all_lenient_continues_past_failures() {
        let (manager, _events) = manager(LifecycleConfig {
            auto_recovery: false,
            ..fast_config()
        });
        let mut config = FleetConfig::default();
        config
            .servers
            .insert("good".to_string(), fake_descriptor("good"));
        config
            .servers
            .insert("bad".to_string(), broken_descriptor("bad"));

        manager.start_all(&config).await.unwrap();
        assert!(manager.get_connection("good").await.is_some());
        assert!(manager.get_connection("bad").await.is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_all_strict_propagates_failure() {
        let (manager, _events) = manager(LifecycleConfig {
            auto_recovery: false,
            ..fast_config()
        });
        let mut bad = broken_descriptor("bad");
        bad.connection_mode = ConnectionMode::Strict;
        let mut config = FleetConfig::default();
        config.servers.insert("bad".to_string(), bad);

        let result = manager.start_all(&config).await;
        assert!(matches!(result, Err(FleetError::TransportUnavailable(_, _))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ready_event_emitted_on_start() {
        let (manager, mut events) = manager(fast_config());
        manager
            .start_connection(fake_descriptor("echo"))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            FleetEvent::ConnectionReady {
                server: "echo".to_string()
            }
        );
        manager.shutdown().await;
    }
}
