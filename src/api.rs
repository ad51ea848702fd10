//! Management surface — HTTP JSON control plane over the fleet.
//!
//! Thin axum router over the lifecycle and unified tool managers. Every
//! error is mapped to the stable envelope
//! `{success:false, code, message, statusCode, requestId}` at this
//! boundary; nothing below it speaks HTTP.

use crate::config::ServerDescriptor;
use crate::error::FleetError;
use crate::lifecycle::{LifecycleManager, RecordState};
use crate::tools::unified::UnifiedToolManager;
use crate::tools::{ToolSource, namespace_external};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared handler state.
pub struct ApiState {
    pub lifecycle: Arc<LifecycleManager>,
    pub tools: Arc<UnifiedToolManager>,
}

/// Build the management router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/servers", get(list_servers).post(add_server))
        .route("/servers/:name", axum::routing::delete(remove_server))
        .route("/servers/:name/tools", get(server_tools))
        .route("/servers/:name/tools/:tool/execute", axum::routing::post(execute_tool))
        .route("/tools", get(all_tools))
        .with_state(state)
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Map a fleet error to the stable envelope.
fn envelope(err: &FleetError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "success": false,
        "code": err.code(),
        "message": err.to_string(),
        "statusCode": err.status_code(),
        "requestId": uuid::Uuid::new_v4().to_string(),
    });
    (status, Json(body)).into_response()
}

fn record_state_str(state: RecordState) -> &'static str {
    match state {
        RecordState::Initializing => "initializing",
        RecordState::Running => "running",
        RecordState::Recovering => "recovering",
        RecordState::ShuttingDown => "shutting_down",
        RecordState::Shutdown => "shutdown",
        RecordState::Failed => "failed",
    }
}

async fn list_servers(State(state): State<Arc<ApiState>>) -> Response {
    let summaries = state.lifecycle.summaries().await;
    let counts = state.lifecycle.counts().await;
    let servers: Vec<Value> = summaries
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "state": record_state_str(s.state),
                "healthy": s.healthy,
                "uptimeMs": s.uptime.as_millis() as u64,
                "errorCount": s.error_count,
                "lastError": s.last_error,
            })
        })
        .collect();
    Json(json!({
        "servers": servers,
        "totalConnected": counts.connected,
        "totalFailed": counts.failed,
        "totalServers": counts.total,
    }))
    .into_response()
}

async fn add_server(State(state): State<Arc<ApiState>>, Json(body): Json<Value>) -> Response {
    let descriptor: ServerDescriptor = match serde_json::from_value(body) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            return envelope(&FleetError::ToolValidationError(
                "descriptor".to_string(),
                e.to_string(),
            ));
        }
    };

    if let Err(e) = descriptor.validate() {
        return envelope(&e);
    }

    let name = descriptor.name.clone();
    let exists = state
        .lifecycle
        .summaries()
        .await
        .iter()
        .any(|s| s.name == name);
    if exists {
        return envelope(&FleetError::DuplicateServer(name));
    }

    match state.lifecycle.start_connection(descriptor).await {
        Ok(_) => Json(json!({
            "serverName": name,
            "connected": true,
            "timestamp": timestamp_ms(),
        }))
        .into_response(),
        Err(e) => envelope(&e),
    }
}

async fn remove_server(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    match state.lifecycle.stop_connection(&name).await {
        Ok(()) => Json(json!({
            "serverId": name,
            "disconnected": true,
            "timestamp": timestamp_ms(),
        }))
        .into_response(),
        Err(e) => envelope(&e),
    }
}

async fn server_tools(State(state): State<Arc<ApiState>>, Path(name): Path<String>) -> Response {
    let Some(connection) = state.lifecycle.get_connection(&name).await else {
        return envelope(&FleetError::ConnectionLost(
            name,
            "server not running or unhealthy".to_string(),
        ));
    };
    let session = match connection.session().await {
        Ok(session) => session,
        Err(e) => return envelope(&e),
    };
    match session.list_tools().await {
        Ok(tools) => {
            let count = tools.len();
            Json(json!({
                "serverId": name,
                "tools": tools,
                "count": count,
            }))
            .into_response()
        }
        Err(e) => envelope(&e),
    }
}

async fn execute_tool(
    State(state): State<Arc<ApiState>>,
    Path((name, tool)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let arguments = body.get("arguments").cloned().unwrap_or(json!({}));
    let namespaced = namespace_external(&name, &tool);
    match state.tools.execute_tool(&namespaced, arguments, None).await {
        Ok(result) => Json(json!({
            "serverId": name,
            "toolName": tool,
            "result": result,
            "executed": true,
            "timestamp": timestamp_ms(),
        }))
        .into_response(),
        Err(e) => envelope(&e),
    }
}

async fn all_tools(State(state): State<Arc<ApiState>>) -> Response {
    match state.tools.all_tools().await {
        Ok(tools) => {
            let rows: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let server_id = match &t.source {
                        ToolSource::External { server } => Some(server.as_str()),
                        ToolSource::Internal => None,
                    };
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                        "serverId": server_id,
                    })
                })
                .collect();
            Json(json!({"tools": rows, "count": rows.len()})).into_response()
        }
        Err(e) => envelope(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::lifecycle::{ConnectionSettings, LifecycleConfig};
    use crate::testutil::fake_server_descriptor;
    use crate::tools::builtin::register_builtin_tools;
    use crate::tools::internal::{InternalToolManager, InternalToolRegistry, ToolServices};
    use crate::tools::unified::{EmbeddingGate, OperatingMode};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_state() -> Arc<ApiState> {
        let lifecycle = LifecycleManager::new(
            LifecycleConfig::default(),
            ConnectionSettings::default(),
            Arc::new(NullSink),
        );
        let registry = InternalToolRegistry::new();
        register_builtin_tools(&registry).unwrap();
        let internal = Arc::new(InternalToolManager::new(
            registry,
            Arc::new(ToolServices::default()),
            Arc::new(NullSink),
        ));
        let tools = Arc::new(UnifiedToolManager::new(
            lifecycle.clone(),
            internal,
            OperatingMode::Api,
            EmbeddingGate::default(),
            Arc::new(NullSink),
        ));
        Arc::new(ApiState { lifecycle, tools })
    }

    async fn request(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (u16, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_post_invalid_descriptor_rejected_without_record() {
        let state = make_state();
        let app = router(state.clone());

        // stdio with no command: validation failure, envelope per contract
        let (status, body) = request(
            &app,
            "POST",
            "/servers",
            Some(json!({"name": "x", "type": "stdio"})),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "MCP_SERVER_ERROR");
        assert_eq!(body["statusCode"], 400);
        assert!(body["requestId"].is_string());

        let (_, listing) = request(&app, "GET", "/servers", None).await;
        assert_eq!(listing["totalServers"], 0);

        state.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_lifecycle_over_http() {
        let state = make_state();
        let app = router(state.clone());
        let descriptor = serde_json::to_value(fake_server_descriptor("echo")).unwrap();

        let (status, body) = request(&app, "POST", "/servers", Some(descriptor.clone())).await;
        assert_eq!(status, 200, "start failed: {body}");
        assert_eq!(body["serverName"], "echo");
        assert_eq!(body["connected"], true);
        assert!(body["timestamp"].as_u64().unwrap() > 0);

        // duplicate name conflicts
        let (status, body) = request(&app, "POST", "/servers", Some(descriptor)).await;
        assert_eq!(status, 409);
        assert_eq!(body["success"], false);

        let (status, body) = request(&app, "GET", "/servers", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["totalServers"], 1);
        assert_eq!(body["totalConnected"], 1);
        assert_eq!(body["servers"][0]["name"], "echo");
        assert_eq!(body["servers"][0]["state"], "running");

        let (status, body) = request(&app, "GET", "/servers/echo/tools", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["serverId"], "echo");
        assert_eq!(body["count"], 1);
        assert_eq!(body["tools"][0]["name"], "ping");

        let (status, body) = request(
            &app,
            "POST",
            "/servers/echo/tools/ping/execute",
            Some(json!({"arguments": {"x": 1}})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["executed"], true);
        assert_eq!(body["toolName"], "ping");
        assert_eq!(body["result"]["ok"], true);

        let (status, body) = request(&app, "DELETE", "/servers/echo", None).await;
        assert_eq!(status, 200);
        assert_eq!(body["disconnected"], true);

        let (_, listing) = request(&app, "GET", "/servers", None).await;
        assert_eq!(listing["totalServers"], 0);

        state.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_unknown_server_not_found() {
        let state = make_state();
        let app = router(state.clone());
        let (status, body) = request(&app, "DELETE", "/servers/nope", None).await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");
        state.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn test_tools_endpoint_aggregates_with_server_ids() {
        let state = make_state();
        let app = router(state.clone());
        state
            .lifecycle
            .start_connection(fake_server_descriptor("echo"))
            .await
            .unwrap();

        let (status, body) = request(&app, "GET", "/tools", None).await;
        assert_eq!(status, 200);
        let tools = body["tools"].as_array().unwrap();
        let external = tools.iter().find(|t| t["name"] == "echo/ping").unwrap();
        assert_eq!(external["serverId"], "echo");
        let internal = tools
            .iter()
            .find(|t| t["name"] == "cipher_memory_search")
            .unwrap();
        assert!(internal["serverId"].is_null());

        state.lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_on_unknown_server_maps_to_envelope() {
        let state = make_state();
        let app = router(state.clone());
        let (status, body) = request(
            &app,
            "POST",
            "/servers/ghost/tools/ping/execute",
            Some(json!({"arguments": {}})),
        )
        .await;
        assert_eq!(status, 404);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");
        state.lifecycle.shutdown().await;
    }
}
