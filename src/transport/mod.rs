//! Wire transports and the factory that materializes them.
//!
//! A [`Transport`] is a pair of framed channels (outbound frames toward the
//! server, inbound frames from it) plus the resources behind them: a child
//! process for stdio, HTTP plumbing for the network kinds. IO runs in
//! background tasks owned by the transport's cancellation token; disposal
//! cancels the tasks and releases OS resources, and is idempotent.

pub mod http;
pub mod sse;
pub mod stdio;

use crate::config::{ServerDescriptor, TransportKind};
use crate::error::FleetError;
use crate::protocol::RpcFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// A live bidirectional message channel to one server.
pub struct Transport {
    server: String,
    kind: TransportKind,
    outbound: mpsc::Sender<RpcFrame>,
    inbound: Option<mpsc::Receiver<RpcFrame>>,
    cancel: CancellationToken,
    /// Child process slot, stdio only. Emptied on dispose so the
    /// terminate sequence runs exactly once.
    child: Option<Arc<Mutex<Option<Child>>>>,
}

impl Transport {
    pub(crate) fn new(
        server: String,
        kind: TransportKind,
        outbound: mpsc::Sender<RpcFrame>,
        inbound: mpsc::Receiver<RpcFrame>,
        cancel: CancellationToken,
        child: Option<Arc<Mutex<Option<Child>>>>,
    ) -> Self {
        Self {
            server,
            kind,
            outbound,
            inbound: Some(inbound),
            cancel,
            child,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue one frame for the wire.
    pub async fn send(&self, frame: RpcFrame) -> crate::Result<()> {
        self.outbound.send(frame).await.map_err(|_| {
            FleetError::ConnectionLost(self.server.clone(), "transport channel closed".to_string())
        })
    }

    /// A clonable sender for the session's writer half.
    pub fn sender(&self) -> mpsc::Sender<RpcFrame> {
        self.outbound.clone()
    }

    /// Take the inbound receiver. The session's reader task owns it; a
    /// second take returns `None`.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<RpcFrame>> {
        self.inbound.take()
    }

    /// Release OS resources: stop IO tasks, and for stdio terminate the
    /// child (SIGTERM, then force-kill after a grace period). Idempotent.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        if let Some(child_slot) = &self.child {
            stdio::terminate_child(&self.server, child_slot).await;
        }
    }
}

/// Constructs transports from descriptors.
pub struct TransportFactory;

impl TransportFactory {
    /// Create and open a channel for the descriptor.
    ///
    /// The descriptor `timeout` caps the open phase; exceeding it is
    /// `TimeoutExceeded`. `attempt` is forwarded for logging, and
    /// `session_id_hint` pre-seeds the session header on streamable-http.
    pub async fn create(
        descriptor: &ServerDescriptor,
        attempt: u32,
        session_id_hint: Option<String>,
    ) -> crate::Result<Transport> {
        descriptor.validate()?;

        tracing::debug!(
            server = %descriptor.name,
            kind = ?descriptor.kind,
            attempt,
            "opening transport"
        );

        let open = async {
            match descriptor.kind {
                TransportKind::Stdio => stdio::connect(descriptor).await,
                TransportKind::Sse => sse::connect(descriptor).await,
                TransportKind::StreamableHttp => http::connect(descriptor, session_id_hint).await,
            }
        };

        match tokio::time::timeout(Duration::from_millis(descriptor.timeout_ms), open).await {
            Ok(result) => result,
            Err(_elapsed) => Err(FleetError::TimeoutExceeded(
                descriptor.name.clone(),
                descriptor.timeout_ms,
            )),
        }
    }

    /// Idempotent release of a transport's OS resources.
    pub async fn dispose(transport: &Transport) {
        transport.dispose().await;
    }
}

/// Parse one wire line into a frame, discarding noise.
///
/// Non-JSON lines are dropped silently (managed servers are allowed to be
/// noisy on stdout); JSON that is not a valid frame is logged and dropped.
pub(crate) fn parse_frame_line(server: &str, line: &str) -> Option<RpcFrame> {
    if line.trim().is_empty() {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(server = %server, line = %line, "discarding non-JSON line");
            return None;
        }
    };
    match serde_json::from_value::<RpcFrame>(value) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(server = %server, error = %e, "discarding malformed frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerDescriptor;

    #[test]
    fn test_parse_frame_line_discards_noise() {
        assert!(parse_frame_line("t", "starting up...").is_none());
        assert!(parse_frame_line("t", "").is_none());
        assert!(parse_frame_line("t", "   ").is_none());
    }

    #[test]
    fn test_parse_frame_line_accepts_frames() {
        let frame =
            parse_frame_line("t", r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(frame.id, Some(1));
        assert!(frame.is_response());
    }

    #[test]
    fn test_parse_frame_line_accepts_notifications() {
        let frame =
            parse_frame_line("t", r#"{"jsonrpc":"2.0","method":"log","params":{"m":"hi"}}"#)
                .unwrap();
        assert!(frame.is_notification());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_descriptor() {
        let mut descriptor = ServerDescriptor::stdio("bad", "cmd");
        descriptor.command = None;
        let result = TransportFactory::create(&descriptor, 1, None).await;
        assert!(matches!(result, Err(FleetError::ConfigInvalid(name, _)) if name == "bad"));
    }
}
