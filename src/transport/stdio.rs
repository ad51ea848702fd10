//! Child-process stdio transport.
//!
//! Spawns the descriptor's command and frames newline-delimited JSON over
//! its stdin/stdout. Stdout lines that are not valid frames are discarded
//! silently so noisy servers cannot corrupt the RPC stream; stderr is
//! drained into a rolling buffer for diagnostics. Disposal sends SIGTERM
//! and force-kills after a grace period.

use crate::config::{ServerDescriptor, resolve_env_vars};
use crate::error::FleetError;
use crate::protocol::RpcFrame;
use crate::transport::{Transport, parse_frame_line};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Grace period between SIGTERM and force-kill on dispose.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long after spawn to check whether the child exited immediately.
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(75);

/// Outbound/inbound channel depth per transport.
const CHANNEL_DEPTH: usize = 32;

/// Rolling buffer of recent stderr lines from a managed child process.
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a new stderr line, evicting the oldest if at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }
}

/// Spawn the descriptor's command with args and resolved env, all pipes attached.
fn spawn_child(descriptor: &ServerDescriptor) -> crate::Result<Child> {
    let command_str = descriptor.command.as_ref().ok_or_else(|| {
        FleetError::ConfigInvalid(
            descriptor.name.clone(),
            "stdio transport requires 'command' field".to_string(),
        )
    })?;

    let mut cmd = Command::new(command_str);

    if !descriptor.args.is_empty() {
        cmd.args(&descriptor.args);
    }
    if !descriptor.env.is_empty() {
        cmd.envs(resolve_env_vars(&descriptor.env));
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    cmd.spawn()
        .map_err(|e| FleetError::TransportUnavailable(descriptor.name.clone(), e.to_string()))
}

/// Open a stdio transport: spawn the child and wire its pipes to framed channels.
pub(crate) async fn connect(descriptor: &ServerDescriptor) -> crate::Result<Transport> {
    let server = descriptor.name.clone();
    let mut child = spawn_child(descriptor)?;

    let mut child_stdin = child.stdin.take().ok_or_else(|| {
        FleetError::TransportUnavailable(server.clone(), "failed to open stdin pipe".to_string())
    })?;
    let child_stdout = child.stdout.take().ok_or_else(|| {
        FleetError::TransportUnavailable(server.clone(), "failed to open stdout pipe".to_string())
    })?;
    let child_stderr = child.stderr.take().ok_or_else(|| {
        FleetError::TransportUnavailable(server.clone(), "failed to open stderr pipe".to_string())
    })?;

    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RpcFrame>(CHANNEL_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel::<RpcFrame>(CHANNEL_DEPTH);

    // Writer: serialize outbound frames as JSON lines onto the child's stdin.
    let writer_cancel = cancel.clone();
    let writer_server = server.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    let line = match serde_json::to_string(&frame) {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::warn!(server = %writer_server, error = %e, "unserializable frame dropped");
                            continue;
                        }
                    };
                    if child_stdin.write_all(line.as_bytes()).await.is_err()
                        || child_stdin.write_all(b"\n").await.is_err()
                        || child_stdin.flush().await.is_err()
                    {
                        tracing::warn!(server = %writer_server, "stdin write failed, stopping writer");
                        break;
                    }
                }
                _ = writer_cancel.cancelled() => break,
            }
        }
    });

    // Reader: filter stdout lines into frames; EOF closes the inbound channel.
    let reader_cancel = cancel.clone();
    let reader_server = server.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if let Some(frame) = parse_frame_line(&reader_server, &line) {
                                if inbound_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) | Err(_) => {
                            tracing::debug!(server = %reader_server, "stdout closed");
                            break;
                        }
                    }
                }
                _ = reader_cancel.cancelled() => break,
            }
        }
        // inbound_tx dropped here: the session observes EOF
    });

    // Stderr drain: log and buffer for diagnostics.
    let stderr_buf = Arc::new(Mutex::new(StderrBuffer::new(100)));
    let drain_buf = stderr_buf.clone();
    let drain_cancel = cancel.clone();
    let drain_server = server.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %drain_server, line = %line, "server stderr");
                            drain_buf.lock().await.push(line);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = drain_cancel.cancelled() => break,
            }
        }
    });

    let child_slot = Arc::new(Mutex::new(Some(child)));

    // A command that exits before it could possibly serve the handshake is
    // a spawn failure, not a session error.
    tokio::time::sleep(EARLY_EXIT_WINDOW).await;
    {
        let mut slot = child_slot.lock().await;
        if let Some(child) = slot.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                slot.take();
                cancel.cancel();
                return Err(FleetError::TransportUnavailable(
                    server,
                    format!("command exited immediately with {status}"),
                ));
            }
        }
    }

    tracing::debug!(server = %server, "stdio transport open");
    Ok(Transport::new(
        server,
        descriptor.kind,
        outbound_tx,
        inbound_rx,
        cancel,
        Some(child_slot),
    ))
}

/// SIGTERM the child, wait out the grace period, then force-kill.
///
/// Takes the child out of its slot first, so repeated disposal is a no-op.
pub(crate) async fn terminate_child(server: &str, child_slot: &Arc<Mutex<Option<Child>>>) {
    let Some(mut child) = child_slot.lock().await.take() else {
        return;
    };

    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(_) => {
                tracing::debug!(server = %server, "child exited after SIGTERM");
                return;
            }
            Err(_elapsed) => {
                tracing::warn!(server = %server, "child ignored SIGTERM, force-killing");
            }
        }
    }

    let _ = child.kill().await;
}
