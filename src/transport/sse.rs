//! Server-sent-events transport.
//!
//! Inbound frames arrive on a standing GET stream with
//! `Accept: text/event-stream`; outbound frames are POSTed to the same URL.
//! Reconnection after stream failure is the enclosing retry strategy's
//! concern — this transport reports the loss and stops.

use crate::config::ServerDescriptor;
use crate::error::FleetError;
use crate::protocol::RpcFrame;
use crate::transport::{Transport, parse_frame_line};
use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHANNEL_DEPTH: usize = 32;

/// Build a header map from descriptor headers, copied verbatim.
pub(crate) fn header_map(descriptor: &ServerDescriptor) -> crate::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in &descriptor.headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            FleetError::ConfigInvalid(descriptor.name.clone(), format!("bad header '{key}': {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            FleetError::ConfigInvalid(descriptor.name.clone(), format!("bad header '{key}': {e}"))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Drain complete SSE events out of the accumulation buffer.
///
/// Returns the concatenated `data:` payload of each complete
/// (blank-line-terminated) event; incomplete trailing input stays in `buf`.
pub(crate) fn drain_sse_events(buf: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buf.find("\n\n") {
        let block: String = buf.drain(..pos + 2).collect();
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if !data_lines.is_empty() {
            out.push(data_lines.join("\n"));
        }
    }
    out
}

/// Open an SSE transport: standing GET for inbound, POST per outbound frame.
pub(crate) async fn connect(descriptor: &ServerDescriptor) -> crate::Result<Transport> {
    let server = descriptor.name.clone();
    let url = descriptor.url.clone().ok_or_else(|| {
        FleetError::ConfigInvalid(server.clone(), "sse transport requires 'url' field".to_string())
    })?;

    let client = reqwest::Client::builder()
        .default_headers(header_map(descriptor)?)
        .build()
        .map_err(|e| FleetError::TransportUnavailable(server.clone(), e.to_string()))?;

    let response = client
        .get(&url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| FleetError::TransportUnavailable(server.clone(), e.to_string()))?
        .error_for_status()
        .map_err(|e| FleetError::TransportUnavailable(server.clone(), e.to_string()))?;

    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RpcFrame>(CHANNEL_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel::<RpcFrame>(CHANNEL_DEPTH);

    // Reader: parse the event stream into frames until it ends.
    let reader_cancel = cancel.clone();
    let reader_server = server.clone();
    let reader_inbound = inbound_tx.clone();
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut buf = String::new();
        loop {
            tokio::select! {
                maybe_chunk = stream.next() => {
                    match maybe_chunk {
                        Some(Ok(chunk)) => {
                            buf.push_str(&String::from_utf8_lossy(&chunk));
                            for payload in drain_sse_events(&mut buf) {
                                if let Some(frame) = parse_frame_line(&reader_server, &payload) {
                                    if reader_inbound.send(frame).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(server = %reader_server, error = %e, "event stream error");
                            break;
                        }
                        None => {
                            tracing::debug!(server = %reader_server, "event stream closed");
                            break;
                        }
                    }
                }
                _ = reader_cancel.cancelled() => break,
            }
        }
        // reader_inbound dropped: session observes EOF once the writer's clone goes too
    });

    // Writer: POST each outbound frame. Some servers answer the POST body
    // directly; forward any frame found there as well.
    let writer_cancel = cancel.clone();
    let writer_server = server.clone();
    let writer_url = url.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    let result = client.post(&writer_url).json(&frame).send().await;
                    match result {
                        Ok(response) => {
                            let is_json = response
                                .headers()
                                .get(reqwest::header::CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok())
                                .map(|ct| ct.starts_with("application/json"))
                                .unwrap_or(false);
                            if is_json {
                                if let Ok(text) = response.text().await {
                                    if let Some(reply) = parse_frame_line(&writer_server, &text) {
                                        let _ = inbound_tx.send(reply).await;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(server = %writer_server, error = %e, "outbound POST failed");
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
                _ = writer_cancel.cancelled() => break,
            }
        }
    });

    tracing::debug!(server = %server, "sse transport open");
    Ok(Transport::new(
        server,
        descriptor.kind,
        outbound_tx,
        inbound_rx,
        cancel,
        None,
    ))
}
