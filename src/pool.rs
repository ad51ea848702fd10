//! LRU connection pool for clustered backends.
//!
//! Process-scoped container (created at startup and handed to whoever
//! needs it, never a hidden global) holding up to `max_connections` live
//! connections keyed by backend. Checked-out entries carry a refcount
//! guard; a background sweeper evicts entries idle past the TTL. Eviction
//! under capacity pressure prefers zero-refcount entries, then the
//! oldest-used.

use crate::connection::ServerConnection;
use crate::error::FleetError;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Pool tuning. Defaults: 10 connections, 5 min idle TTL, 60 s sweep.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct PoolEntry {
    connection: Arc<ServerConnection>,
    last_used: Instant,
    refcount: Arc<AtomicUsize>,
}

/// Checked-out pool entry. Dropping it releases the refcount.
pub struct PooledConnection {
    connection: Arc<ServerConnection>,
    refcount: Arc<AtomicUsize>,
}

impl Deref for PooledConnection {
    type Target = Arc<ServerConnection>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics {
    pub entries: usize,
    pub checked_out: usize,
}

/// Keyed LRU pool of server connections.
pub struct ClusterPool {
    config: PoolConfig,
    entries: Mutex<HashMap<String, PoolEntry>>,
    cancel: CancellationToken,
}

impl ClusterPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the background sweep loop.
    pub fn start_sweeper(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pool.config.sweep_interval) => pool.sweep().await,
                    _ = pool.cancel.cancelled() => break,
                }
            }
        });
    }

    /// Add a connection under `key`, evicting per policy when full.
    pub async fn insert(
        &self,
        key: &str,
        connection: Arc<ServerConnection>,
    ) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FleetError::ShuttingDown("cluster pool".to_string()));
        }
        let mut entries = self.entries.lock().await;

        if let Some(old) = entries.remove(key) {
            old.connection.request_shutdown();
        }

        if entries.len() >= self.config.max_connections {
            // Prefer an idle entry; otherwise take the oldest-used one.
            let victim = entries
                .iter()
                .filter(|(_, e)| e.refcount.load(Ordering::Acquire) == 0)
                .min_by_key(|(_, e)| e.last_used)
                .or_else(|| entries.iter().min_by_key(|(_, e)| e.last_used))
                .map(|(k, _)| k.clone());
            if let Some(victim_key) = victim {
                if let Some(evicted) = entries.remove(&victim_key) {
                    tracing::debug!(key = %victim_key, "evicting pooled connection");
                    evicted.connection.request_shutdown();
                }
            }
        }

        entries.insert(
            key.to_string(),
            PoolEntry {
                connection,
                last_used: Instant::now(),
                refcount: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(())
    }

    /// Check out the connection for `key`, bumping its refcount and
    /// last-used time.
    pub async fn checkout(&self, key: &str) -> Option<PooledConnection> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(key)?;
        entry.last_used = Instant::now();
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        Some(PooledConnection {
            connection: entry.connection.clone(),
            refcount: entry.refcount.clone(),
        })
    }

    /// Drop entries idle past the TTL (zero-refcount only) and entries
    /// whose connection is no longer healthy enough to reuse.
    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        let ttl = self.config.idle_ttl;
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| {
                e.refcount.load(Ordering::Acquire) == 0
                    && (e.last_used.elapsed() > ttl || !e.connection.is_healthy())
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(entry) = entries.remove(&key) {
                tracing::debug!(key = %key, "sweeping idle pooled connection");
                entry.connection.request_shutdown();
            }
        }
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let entries = self.entries.lock().await;
        PoolMetrics {
            entries: entries.len(),
            checked_out: entries
                .values()
                .filter(|e| e.refcount.load(Ordering::Acquire) > 0)
                .count(),
        }
    }

    /// Stop the sweeper and shut down every pooled connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            entry.connection.request_shutdown();
        }
    }
}
