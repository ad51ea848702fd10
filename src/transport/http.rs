//! Streamable-HTTP transport.
//!
//! Each outbound frame is POSTed to the descriptor URL; the response body
//! carries the reply either as plain JSON or as an SSE-framed stream.
//! Authorization and custom headers are copied verbatim. A server-assigned
//! session id (`Mcp-Session-Id`) is captured from the first response and
//! echoed on subsequent requests; a hint from a previous incarnation can
//! pre-seed it.

use crate::config::ServerDescriptor;
use crate::error::FleetError;
use crate::protocol::RpcFrame;
use crate::transport::sse::{drain_sse_events, header_map};
use crate::transport::{Transport, parse_frame_line};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHANNEL_DEPTH: usize = 32;

/// Header used to correlate requests to one server-side session.
const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Open a streamable-http transport.
///
/// No wire traffic happens here — the first POST is the session's
/// initialize request — so create only validates the URL and builds the
/// client plumbing.
pub(crate) async fn connect(
    descriptor: &ServerDescriptor,
    session_id_hint: Option<String>,
) -> crate::Result<Transport> {
    let server = descriptor.name.clone();
    let url = descriptor.url.clone().ok_or_else(|| {
        FleetError::ConfigInvalid(
            server.clone(),
            "streamable-http transport requires 'url' field".to_string(),
        )
    })?;

    reqwest::Url::parse(&url)
        .map_err(|e| FleetError::ConfigInvalid(server.clone(), format!("bad url '{url}': {e}")))?;

    let client = reqwest::Client::builder()
        .default_headers(header_map(descriptor)?)
        .build()
        .map_err(|e| FleetError::TransportUnavailable(server.clone(), e.to_string()))?;

    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RpcFrame>(CHANNEL_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel::<RpcFrame>(CHANNEL_DEPTH);
    let session_id: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(session_id_hint));

    let worker_cancel = cancel.clone();
    let worker_server = server.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    let mut request = client
                        .post(&url)
                        .header(ACCEPT, "application/json, text/event-stream")
                        .json(&frame);
                    let current_session = session_id.read().unwrap_or_else(|p| p.into_inner()).clone();
                    if let Some(sid) = current_session {
                        request = request.header(SESSION_HEADER, sid);
                    }

                    let response = match request.send().await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::warn!(server = %worker_server, error = %e, "POST failed");
                            worker_cancel.cancel();
                            break;
                        }
                    };

                    if let Some(sid) = response
                        .headers()
                        .get(SESSION_HEADER)
                        .and_then(|v| v.to_str().ok())
                    {
                        *session_id.write().unwrap_or_else(|p| p.into_inner()) =
                            Some(sid.to_string());
                    }

                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();

                    if content_type.starts_with("application/json") {
                        if let Ok(text) = response.text().await {
                            if let Some(reply) = parse_frame_line(&worker_server, &text) {
                                if inbound_tx.send(reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    } else if content_type.starts_with("text/event-stream") {
                        // Stream the body until the server finishes answering.
                        let mut stream = response.bytes_stream();
                        let mut buf = String::new();
                        while let Some(chunk) = stream.next().await {
                            let Ok(chunk) = chunk else { break };
                            buf.push_str(&String::from_utf8_lossy(&chunk));
                            for payload in drain_sse_events(&mut buf) {
                                if let Some(reply) = parse_frame_line(&worker_server, &payload) {
                                    if inbound_tx.send(reply).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    // Anything else (202 Accepted for notifications) carries no reply.
                }
                _ = worker_cancel.cancelled() => break,
            }
        }
    });

    tracing::debug!(server = %server, "streamable-http transport open");
    Ok(Transport::new(
        server,
        descriptor.kind,
        outbound_tx,
        inbound_rx,
        cancel,
        None,
    ))
}
