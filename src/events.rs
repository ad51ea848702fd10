//! Fleet and tool execution events.
//!
//! Events are delivered through an [`EventSink`] handed to the lifecycle
//! manager and tool managers by parameter — there is no process-wide
//! dispatcher. Peripheral layers (UI, session history) implement the trait;
//! tests use [`ChannelSink`] to observe emission order.

use tokio::sync::mpsc;

/// Lifecycle events emitted by the fleet supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    ConnectionReady { server: String },
    ConnectionFailed { server: String, error: String },
    ConnectionShutdown { server: String },
    Unhealthy { server: String },
    RecoveryStarted { server: String, attempt: u32 },
    ConnectionRecovered { server: String },
    RecoveryFailed { server: String, attempts: u32 },
}

impl FleetEvent {
    /// The server this event concerns.
    pub fn server(&self) -> &str {
        match self {
            FleetEvent::ConnectionReady { server }
            | FleetEvent::ConnectionFailed { server, .. }
            | FleetEvent::ConnectionShutdown { server }
            | FleetEvent::Unhealthy { server }
            | FleetEvent::RecoveryStarted { server, .. }
            | FleetEvent::ConnectionRecovered { server }
            | FleetEvent::RecoveryFailed { server, .. } => server,
        }
    }
}

/// Tool execution events emitted by the tool managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolExecutionEvent {
    Started {
        execution_id: String,
        tool: String,
        session_id: Option<String>,
    },
    Completed {
        execution_id: String,
        tool: String,
        duration_ms: u64,
    },
    Failed {
        execution_id: String,
        tool: String,
        error: String,
    },
}

/// Sink for fleet and tool events, passed by parameter to the managers.
///
/// Implementations must not block: emission happens on supervisor tasks.
pub trait EventSink: Send + Sync {
    fn fleet_event(&self, _event: FleetEvent) {}
    fn tool_event(&self, _event: ToolExecutionEvent) {}
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}

/// Channel-backed sink for observing events in tests and bridges.
pub struct ChannelSink {
    fleet_tx: mpsc::UnboundedSender<FleetEvent>,
    tool_tx: mpsc::UnboundedSender<ToolExecutionEvent>,
}

impl ChannelSink {
    /// Build a sink plus the receivers that observe it.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<FleetEvent>,
        mpsc::UnboundedReceiver<ToolExecutionEvent>,
    ) {
        let (fleet_tx, fleet_rx) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        (ChannelSink { fleet_tx, tool_tx }, fleet_rx, tool_rx)
    }
}

impl EventSink for ChannelSink {
    fn fleet_event(&self, event: FleetEvent) {
        let _ = self.fleet_tx.send(event);
    }

    fn tool_event(&self, event: ToolExecutionEvent) {
        let _ = self.tool_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_accepts_events() {
        let sink = NullSink;
        sink.fleet_event(FleetEvent::ConnectionReady {
            server: "gh".to_string(),
        });
        sink.tool_event(ToolExecutionEvent::Started {
            execution_id: "x".to_string(),
            tool: "cipher_memory_search".to_string(),
            session_id: None,
        });
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut fleet_rx, _tool_rx) = ChannelSink::new();
        sink.fleet_event(FleetEvent::Unhealthy {
            server: "beta".to_string(),
        });
        sink.fleet_event(FleetEvent::RecoveryStarted {
            server: "beta".to_string(),
            attempt: 1,
        });
        sink.fleet_event(FleetEvent::ConnectionRecovered {
            server: "beta".to_string(),
        });

        assert_eq!(
            fleet_rx.recv().await.unwrap(),
            FleetEvent::Unhealthy {
                server: "beta".to_string()
            }
        );
        assert_eq!(
            fleet_rx.recv().await.unwrap(),
            FleetEvent::RecoveryStarted {
                server: "beta".to_string(),
                attempt: 1
            }
        );
        assert_eq!(
            fleet_rx.recv().await.unwrap().server(),
            "beta"
        );
    }

    #[test]
    fn test_dropped_receiver_does_not_panic() {
        let (sink, fleet_rx, tool_rx) = ChannelSink::new();
        drop(fleet_rx);
        drop(tool_rx);
        sink.fleet_event(FleetEvent::ConnectionShutdown {
            server: "gone".to_string(),
        });
        sink.tool_event(ToolExecutionEvent::Failed {
            execution_id: "e".to_string(),
            tool: "t".to_string(),
            error: "boom".to_string(),
        });
    }
}
