//! Cipher Fleet — connection fleet supervisor for the Cipher agent host.
//! Brings up, health-checks, retries, circuit-breaks, and shuts down a
//! dynamic fleet of per-server RPC connections (stdio, SSE, streamable
//! HTTP), and mediates every tool call through a unified catalog of
//! external and built-in tools.

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod pool;
pub mod protocol;
pub mod resilience;
pub mod session;
pub mod tools;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::{ApiState, router};
pub use config::{
    ConnectionMode, FleetConfig, ServerDescriptor, TransportKind, parse_env_ref, resolve_env_vars,
};
pub use connection::{ConnectionState, ServerConnection};
pub use error::{FleetError, Result};
pub use events::{ChannelSink, EventSink, FleetEvent, NullSink, ToolExecutionEvent};
pub use health::{HealthConfig, HealthEvent, HealthMonitor};
pub use lifecycle::{ConnectionSettings, LifecycleConfig, LifecycleManager};
pub use pool::{ClusterPool, PoolConfig};
pub use protocol::{ClientInfo, RpcFrame, ServerInfo, ToolDef, ToolResult};
pub use resilience::{BreakerConfig, CircuitBreaker, RetryConfig, RetryStrategy};
pub use session::ServerSession;
pub use tools::internal::{InternalToolManager, InternalToolRegistry, ToolServices};
pub use tools::unified::{EmbeddingGate, OperatingMode, UnifiedToolManager};
pub use transport::{Transport, TransportFactory};
