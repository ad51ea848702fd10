//! One managed server connection: session + transport + resilience wrappers.
//!
//! Composes a session over one transport with a circuit breaker, a retry
//! strategy, and a health monitor, behind a private state machine:
//! `new → initializing → running → {recovering → running} → shutting_down
//! → shutdown`, with any state able to fall to `failed` on an
//! unrecoverable error. Initialization and recovery are serialized by the
//! connection lock; shutdown is an idempotent latch.

use crate::config::ServerDescriptor;
use crate::error::FleetError;
use crate::health::{HealthConfig, HealthMonitor};
use crate::protocol::ClientInfo;
use crate::resilience::{BreakerConfig, BreakerStats, CircuitBreaker, RetryConfig, RetryStrategy};
use crate::session::ServerSession;
use crate::transport::{Transport, TransportFactory};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Initializing,
    Running,
    Recovering,
    ShuttingDown,
    Shutdown,
    Failed,
}

/// Diagnostic snapshot of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub uptime: Duration,
    pub connect_attempts: u32,
    pub consecutive_probe_failures: u32,
    pub last_error: Option<String>,
    pub breaker: BreakerStats,
}

/// A session plus its resilience wrappers and lifecycle state.
pub struct ServerConnection {
    descriptor: ServerDescriptor,
    state_tx: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<ServerSession>>>,
    transport: Mutex<Option<Transport>>,
    breaker: CircuitBreaker,
    retry: RetryStrategy,
    monitor: Arc<HealthMonitor>,
    /// Serializes initialize/reinitialize; never interleaves with shutdown.
    init_lock: Mutex<()>,
    initialized: CancellationToken,
    shutdown_requested: CancellationToken,
    shutdown_complete: CancellationToken,
    connect_attempts: AtomicU32,
    probe_failures: AtomicU32,
    healthy: AtomicBool,
    has_error: AtomicBool,
    last_error: std::sync::Mutex<Option<String>>,
    started_at: Instant,
}

impl ServerConnection {
    pub fn new(
        descriptor: ServerDescriptor,
        breaker_config: BreakerConfig,
        retry_config: RetryConfig,
        health_config: HealthConfig,
    ) -> Arc<Self> {
        let name = descriptor.name.clone();
        let (state_tx, _) = watch::channel(ConnectionState::New);
        Arc::new(Self {
            breaker: CircuitBreaker::new(&name, breaker_config),
            retry: RetryStrategy::new(&name, retry_config),
            monitor: Arc::new(HealthMonitor::new(&name, health_config)),
            descriptor,
            state_tx,
            session: RwLock::new(None),
            transport: Mutex::new(None),
            init_lock: Mutex::new(()),
            initialized: CancellationToken::new(),
            shutdown_requested: CancellationToken::new(),
            shutdown_complete: CancellationToken::new(),
            connect_attempts: AtomicU32::new(0),
            probe_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(false),
            has_error: AtomicBool::new(false),
            last_error: std::sync::Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions; used by the lifecycle manager to await
    /// running-or-failed without polling.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.is_cancelled()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    pub fn monitor(&self) -> Arc<HealthMonitor> {
        self.monitor.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            uptime: self.started_at.elapsed(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            consecutive_probe_failures: self.probe_failures.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            breaker: self.breaker.stats(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        // send_replace updates the value even when nobody is subscribed
        self.state_tx.send_replace(state);
    }

    fn record_error(&self, error: &FleetError) {
        self.has_error.store(true, Ordering::Release);
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(error.to_string());
    }

    /// Bring the connection up. Runs once under the connection lock; the
    /// retry strategy wraps transport creation plus the session handshake.
    pub async fn initialize(&self) -> crate::Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        if self.shutdown_requested.is_cancelled() {
            return Err(FleetError::ShuttingDown(self.name().to_string()));
        }

        self.set_state(ConnectionState::Initializing);
        match self
            .retry
            .execute(|| self.create_and_initialize_session())
            .await
        {
            Ok(()) => {
                self.healthy.store(true, Ordering::Release);
                self.probe_failures.store(0, Ordering::Release);
                self.set_state(ConnectionState::Running);
                self.initialized.cancel();
                tracing::info!(server = %self.name(), "connection initialized");
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                self.set_state(ConnectionState::Failed);
                tracing::error!(server = %self.name(), error = %e, "connection initialization failed");
                Err(e)
            }
        }
    }

    /// One connect attempt: open a transport, bind a session, handshake.
    async fn create_and_initialize_session(&self) -> crate::Result<()> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let mut transport = TransportFactory::create(&self.descriptor, attempt, None).await?;
        let session = ServerSession::start(
            &mut transport,
            Duration::from_millis(self.descriptor.timeout_ms),
        )?;

        match session.initialize(ClientInfo::default()).await {
            Ok(_info) => {
                *self.session.write().await = Some(session);
                *self.transport.lock().await = Some(transport);
                Ok(())
            }
            Err(e) => {
                session.disconnect();
                transport.dispose().await;
                Err(e)
            }
        }
    }

    /// The live session. Awaits the initialized latch; fails with
    /// `ConnectionLost` once shutdown has been requested.
    pub async fn session(&self) -> crate::Result<Arc<ServerSession>> {
        if self.shutdown_requested.is_cancelled() {
            return Err(FleetError::ConnectionLost(
                self.name().to_string(),
                "connection shut down".to_string(),
            ));
        }

        tokio::select! {
            _ = self.initialized.cancelled() => {}
            _ = self.shutdown_requested.cancelled() => {
                return Err(FleetError::ConnectionLost(
                    self.name().to_string(),
                    "connection shut down".to_string(),
                ));
            }
        }

        self.session.read().await.clone().ok_or_else(|| {
            FleetError::ConnectionLost(self.name().to_string(), "no live session".to_string())
        })
    }

    /// One liveness probe: a trivial RPC, guarded by the circuit breaker
    /// and bounded by the health-check timeout.
    pub async fn perform_health_check(&self) -> crate::Result<()> {
        let probe_timeout = self.monitor.config().timeout;
        let name = self.name().to_string();
        let result = match self.session.read().await.clone() {
            Some(session) => {
                let probe_name = name.clone();
                self.breaker
                    .execute(move || async move {
                        match tokio::time::timeout(probe_timeout, session.list_prompts()).await {
                            Ok(Ok(_prompts)) => Ok(()),
                            Ok(Err(e)) => Err(e),
                            Err(_elapsed) => Err(FleetError::TimeoutExceeded(
                                probe_name,
                                probe_timeout.as_millis() as u64,
                            )),
                        }
                    })
                    .await
            }
            None => Err(FleetError::ConnectionLost(
                name,
                "no live session".to_string(),
            )),
        };

        match result {
            Ok(()) => {
                self.probe_failures.store(0, Ordering::Release);
                self.healthy.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                let failures = self.probe_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.monitor.config().max_consecutive_failures {
                    self.healthy.store(false, Ordering::Release);
                    self.record_error(&e);
                }
                Err(e)
            }
        }
    }

    /// Tear down and reconnect, for the recovery path. Serialized with
    /// initialize by the connection lock.
    pub async fn reinitialize(&self) -> crate::Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.shutdown_requested.is_cancelled() {
            return Err(FleetError::ShuttingDown(self.name().to_string()));
        }

        self.set_state(ConnectionState::Recovering);
        if let Some(session) = self.session.write().await.take() {
            session.disconnect();
        }
        if let Some(transport) = self.transport.lock().await.take() {
            transport.dispose().await;
        }
        self.has_error.store(false, Ordering::Release);
        self.probe_failures.store(0, Ordering::Release);

        match self
            .retry
            .execute(|| self.create_and_initialize_session())
            .await
        {
            Ok(()) => {
                self.healthy.store(true, Ordering::Release);
                self.initialized.cancel();
                self.set_state(ConnectionState::Running);
                tracing::info!(server = %self.name(), "connection reinitialized");
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Request teardown. Idempotent: the first call sets the latch and
    /// schedules the background shutdown; later calls are no-ops.
    pub fn request_shutdown(self: &Arc<Self>) {
        if self.shutdown_requested.is_cancelled() {
            return;
        }
        self.shutdown_requested.cancel();
        let conn = self.clone();
        tokio::spawn(async move {
            conn.perform_shutdown().await;
        });
    }

    /// Completes when shutdown has finished.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_complete.cancelled().await;
    }

    /// Actual teardown: abort in-flight requests, dispose session then
    /// transport, complete the shutdown latch.
    async fn perform_shutdown(&self) {
        // Wait for any in-flight initialize to release the lock so the two
        // never interleave.
        let _guard = self.init_lock.lock().await;
        self.set_state(ConnectionState::ShuttingDown);

        if let Some(session) = self.session.write().await.take() {
            session.disconnect();
        }
        if let Some(transport) = self.transport.lock().await.take() {
            transport.dispose().await;
        }

        self.healthy.store(false, Ordering::Release);
        self.set_state(ConnectionState::Shutdown);
        self.shutdown_complete.cancel();
        tracing::info!(server = %self.name(), "connection shut down");
    }
}
