//! RPC session — the correlation layer bound to one transport.
//!
//! Requests carry monotonically increasing ids; a reader task routes each
//! response to the oneshot waiter registered under its id and forwards
//! id-less frames as notifications. A reply lost past the request timeout
//! fails only that call — the session stays usable. Disconnecting (or
//! transport EOF) fails every pending request with `ConnectionLost`.

use crate::error::FleetError;
use crate::protocol::{
    ClientInfo, PROTOCOL_VERSION, PromptDef, RpcFrame, ServerInfo, ToolDef, ToolResult, methods,
};
use crate::transport::Transport;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<crate::Result<Value>>>>>;

/// RPC client bound to one transport.
pub struct ServerSession {
    server: String,
    outbound: mpsc::Sender<RpcFrame>,
    pending: PendingMap,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: CancellationToken,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<RpcFrame>>>,
    server_info: RwLock<Option<ServerInfo>>,
}

impl ServerSession {
    /// Bind a session to the transport and start its reader task.
    ///
    /// Takes the transport's inbound receiver; the transport itself stays
    /// with the caller, which remains responsible for disposal.
    pub fn start(transport: &mut Transport, request_timeout: Duration) -> crate::Result<Arc<Self>> {
        let server = transport.server().to_string();
        let inbound = transport.take_inbound().ok_or_else(|| {
            FleetError::ConnectionLost(server.clone(), "transport already bound".to_string())
        })?;

        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        let session = Arc::new(ServerSession {
            server: server.clone(),
            outbound: transport.sender(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            request_timeout,
            closed: CancellationToken::new(),
            notifications: Mutex::new(Some(notif_rx)),
            server_info: RwLock::new(None),
        });

        tokio::spawn(reader_loop(
            server,
            inbound,
            session.pending.clone(),
            notif_tx,
            session.closed.clone(),
        ));

        Ok(session)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Identity reported by the server during the handshake, once complete.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Take the server-initiated notification stream. Single use.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<RpcFrame>> {
        self.notifications
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Issue one request and await its correlated response.
    async fn request(&self, method: &str, params: Value) -> crate::Result<Value> {
        if self.is_closed() {
            return Err(FleetError::ConnectionLost(
                self.server.clone(),
                "session disconnected".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);

        let frame = RpcFrame::request(id, method, params);
        if self.outbound.send(frame).await.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
            return Err(FleetError::ConnectionLost(
                self.server.clone(),
                "transport closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(FleetError::ConnectionLost(
                self.server.clone(),
                "session disconnected".to_string(),
            )),
            Err(_elapsed) => {
                // Forget the waiter; a late reply is dropped by the reader.
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                Err(FleetError::TimeoutExceeded(
                    format!("{}:{}", self.server, method),
                    self.request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Initialize handshake: negotiate the protocol version, record the
    /// server identity, and confirm with the initialized notification.
    pub async fn initialize(&self, client_info: ClientInfo) -> crate::Result<ServerInfo> {
        let result = self
            .request(
                methods::INITIALIZE,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": client_info,
                    "capabilities": {},
                }),
            )
            .await?;

        let info: ServerInfo = result
            .get("serverInfo")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(ServerInfo {
                name: self.server.clone(),
                version: String::new(),
                protocol_version: result
                    .get("protocolVersion")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });

        *self.server_info.write().unwrap_or_else(|p| p.into_inner()) = Some(info.clone());

        let confirm = RpcFrame::notification(methods::INITIALIZED, json!({}));
        self.outbound.send(confirm).await.map_err(|_| {
            FleetError::ConnectionLost(self.server.clone(), "transport closed".to_string())
        })?;

        tracing::info!(server = %self.server, server_name = %info.name, "session initialized");
        Ok(info)
    }

    /// List the tools the server exposes.
    pub async fn list_tools(&self) -> crate::Result<Vec<ToolDef>> {
        let result = self.request(methods::LIST_TOOLS, json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| FleetError::Protocol(self.server.clone(), e.to_string()))?
            .unwrap_or_default();
        Ok(tools)
    }

    /// Invoke one tool. Never retries internally; retry is the caller's concern.
    pub async fn call_tool(&self, name: &str, args: Value) -> crate::Result<ToolResult> {
        let result = self
            .request(methods::CALL_TOOL, json!({"name": name, "arguments": args}))
            .await?;
        match serde_json::from_value::<ToolResult>(result.clone()) {
            Ok(tool_result) => Ok(tool_result),
            // Servers that answer with a bare payload still produce a result
            Err(_) => Ok(ToolResult {
                content: result,
                is_error: false,
            }),
        }
    }

    /// List prompts. Doubles as the liveness probe.
    pub async fn list_prompts(&self) -> crate::Result<Vec<PromptDef>> {
        let result = self.request(methods::LIST_PROMPTS, json!({})).await?;
        let prompts = result
            .get("prompts")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| FleetError::Protocol(self.server.clone(), e.to_string()))?
            .unwrap_or_default();
        Ok(prompts)
    }

    /// Close the session: pending requests fail with `ConnectionLost` and
    /// later requests are rejected. Idempotent.
    pub fn disconnect(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        fail_all_pending(&self.server, &self.pending);
        tracing::debug!(server = %self.server, "session disconnected");
    }
}

fn fail_all_pending(server: &str, pending: &PendingMap) {
    let waiters: Vec<_> = pending
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .drain()
        .collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(FleetError::ConnectionLost(
            server.to_string(),
            "session disconnected".to_string(),
        )));
    }
}

/// Reader task: route responses by id, forward notifications, and fail
/// everything pending when the transport reaches EOF.
async fn reader_loop(
    server: String,
    mut inbound: mpsc::Receiver<RpcFrame>,
    pending: PendingMap,
    notif_tx: mpsc::UnboundedSender<RpcFrame>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            maybe_frame = inbound.recv() => {
                match maybe_frame {
                    Some(frame) if frame.is_response() => {
                        let id = frame.id.unwrap_or_default();
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .remove(&id);
                        match waiter {
                            Some(tx) => {
                                let outcome = match frame.error {
                                    Some(err) => Err(FleetError::Protocol(
                                        server.clone(),
                                        format!("{}: {}", err.code, err.message),
                                    )),
                                    None => Ok(frame.result.unwrap_or(Value::Null)),
                                };
                                let _ = tx.send(outcome);
                            }
                            None => {
                                tracing::debug!(server = %server, id, "response for unknown id dropped");
                            }
                        }
                    }
                    Some(frame) if frame.is_notification() => {
                        let _ = notif_tx.send(frame);
                    }
                    Some(_) => {
                        tracing::debug!(server = %server, "ignoring frame that is neither response nor notification");
                    }
                    None => {
                        tracing::debug!(server = %server, "transport EOF");
                        break;
                    }
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    closed.cancel();
    fail_all_pending(&server, &pending);
}
