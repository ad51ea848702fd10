//! Unified tool manager — one namespace over external and internal tools.
//!
//! Merges the per-server catalogs from the fleet with the internal
//! registry, filtered by operating mode, gated on the embedding
//! capability, and deconflicted by policy. Dispatch routes
//! `cipher_`-prefixed names to the internal manager and
//! `server/tool` names through the fleet.

use crate::error::FleetError;
use crate::events::{EventSink, ToolExecutionEvent};
use crate::lifecycle::LifecycleManager;
use crate::tools::internal::InternalToolManager;
use crate::tools::{
    ToolDescriptor, ToolSource, is_internal_name, namespace_external, split_external,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The synthetic query-only tool exposed in `default` mode.
pub const ASK_CIPHER: &str = "ask_cipher";

/// Catalog policy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Expose exactly `ask_cipher`.
    Default,
    /// External tools plus search/memory internal tools.
    Cli,
    /// Everything, including agent-inaccessible internal tools.
    Aggregator,
    /// External tools plus agent-accessible internal tools.
    Api,
}

/// What to do when an internal and an external name collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    PrefixInternal,
    PreferInternal,
    PreferMcp,
    Error,
}

/// Explicit capability object for the embedding subsystem.
///
/// Passed by parameter so tests can toggle it deterministically; there is
/// no process-global latch.
#[derive(Clone)]
pub struct EmbeddingGate(Arc<AtomicBool>);

impl EmbeddingGate {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

impl Default for EmbeddingGate {
    fn default() -> Self {
        Self::new(true)
    }
}

fn ask_cipher_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: ASK_CIPHER.to_string(),
        description: "Ask the Cipher agent a question".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        }),
        source: ToolSource::Internal,
        agent_accessible: true,
        category: Some("agent".to_string()),
        requires_embeddings: false,
    }
}

/// Merge internal entries into the external catalog per the conflict policy.
fn resolve_conflicts(
    mut external: Vec<ToolDescriptor>,
    mut internal: Vec<ToolDescriptor>,
    policy: ConflictResolution,
) -> crate::Result<Vec<ToolDescriptor>> {
    match policy {
        ConflictResolution::PrefixInternal => {
            // Internal names carry the prefix, so collisions should not
            // occur; if one does anyway, keep both sides unchanged.
            external.append(&mut internal);
        }
        ConflictResolution::PreferInternal => {
            let internal_names: HashSet<&str> =
                internal.iter().map(|t| t.name.as_str()).collect();
            external.retain(|t| !internal_names.contains(t.name.as_str()));
            external.append(&mut internal);
        }
        ConflictResolution::PreferMcp => {
            let external_names: HashSet<&str> =
                external.iter().map(|t| t.name.as_str()).collect();
            internal.retain(|t| !external_names.contains(t.name.as_str()));
            external.append(&mut internal);
        }
        ConflictResolution::Error => {
            let external_names: HashSet<&str> =
                external.iter().map(|t| t.name.as_str()).collect();
            if let Some(dup) = internal
                .iter()
                .find(|t| external_names.contains(t.name.as_str()))
            {
                return Err(FleetError::ConfigInvalid(
                    "catalog".to_string(),
                    format!("tool name collision: {}", dup.name),
                ));
            }
            external.append(&mut internal);
        }
    }
    Ok(external)
}

/// The public dispatch surface over external and internal tools.
pub struct UnifiedToolManager {
    lifecycle: Arc<LifecycleManager>,
    internal: Arc<InternalToolManager>,
    mode: OperatingMode,
    conflict_resolution: ConflictResolution,
    embeddings: EmbeddingGate,
    sink: Arc<dyn EventSink>,
    external_enabled: bool,
    internal_enabled: bool,
}

impl UnifiedToolManager {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        internal: Arc<InternalToolManager>,
        mode: OperatingMode,
        embeddings: EmbeddingGate,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            lifecycle,
            internal,
            mode,
            conflict_resolution: ConflictResolution::PrefixInternal,
            embeddings,
            sink,
            external_enabled: true,
            internal_enabled: true,
        }
    }

    pub fn with_conflict_resolution(mut self, policy: ConflictResolution) -> Self {
        self.conflict_resolution = policy;
        self
    }

    pub fn with_external_enabled(mut self, enabled: bool) -> Self {
        self.external_enabled = enabled;
        self
    }

    pub fn with_internal_enabled(mut self, enabled: bool) -> Self {
        self.internal_enabled = enabled;
        self
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Whether the operating mode admits an internal tool into the catalog.
    ///
    /// `agent_accessible = false` is an absolute block everywhere except
    /// `aggregator`, which explicitly overrides it.
    fn mode_admits(&self, tool: &ToolDescriptor) -> bool {
        match self.mode {
            OperatingMode::Aggregator => true,
            OperatingMode::Api => tool.agent_accessible,
            OperatingMode::Cli => {
                tool.agent_accessible
                    && (tool.name.contains("search") || tool.name.contains("memory"))
            }
            OperatingMode::Default => false,
        }
    }

    /// Build the unified catalog.
    pub async fn all_tools(&self) -> crate::Result<Vec<ToolDescriptor>> {
        if self.mode == OperatingMode::Default {
            return Ok(vec![ask_cipher_descriptor()]);
        }

        let mut external = Vec::new();
        if self.external_enabled {
            for (server, connection) in self.lifecycle.running_connections().await {
                let session = match connection.session().await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "skipping server without session");
                        continue;
                    }
                };
                match session.list_tools().await {
                    Ok(tools) => {
                        external.extend(tools.into_iter().map(|t| ToolDescriptor {
                            name: namespace_external(&server, &t.name),
                            description: t.description.unwrap_or_default(),
                            parameters: t.input_schema,
                            source: ToolSource::External {
                                server: server.clone(),
                            },
                            agent_accessible: true,
                            category: None,
                            requires_embeddings: false,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "tool listing failed, proceeding without it");
                    }
                }
            }
        }

        let internal = if self.internal_enabled {
            self.internal
                .registry()
                .list()
                .into_iter()
                .filter(|t| self.mode_admits(t))
                .filter(|t| self.embeddings.enabled() || !t.requires_embeddings)
                .collect()
        } else {
            Vec::new()
        };

        resolve_conflicts(external, internal, self.conflict_resolution)
    }

    /// Dispatch one tool call to the owning manager.
    pub async fn execute_tool(
        &self,
        name: &str,
        args: Value,
        session_id: Option<String>,
    ) -> crate::Result<Value> {
        if self.mode == OperatingMode::Default {
            if name != ASK_CIPHER {
                return Err(FleetError::ToolNotAllowed(
                    name.to_string(),
                    "default mode exposes only ask_cipher".to_string(),
                ));
            }
            return self.ask_cipher(args).await;
        }

        if is_internal_name(name) {
            let tool = self
                .internal
                .registry()
                .get(name)
                .ok_or_else(|| FleetError::ToolNotFound(name.to_string()))?;
            if !self.mode_admits(&tool.descriptor()) {
                return Err(FleetError::ToolNotAllowed(
                    name.to_string(),
                    "not exposed in this operating mode".to_string(),
                ));
            }
            if tool.requires_embeddings && !self.embeddings.enabled() {
                return Err(FleetError::EmbeddingsDisabled(name.to_string()));
            }
            // The internal manager emits its own execution events.
            return self.internal.execute(name, args, session_id).await;
        }

        let (server, tool) = split_external(name)
            .ok_or_else(|| FleetError::ToolNotFound(name.to_string()))?;
        let connection = self.lifecycle.get_connection(server).await.ok_or_else(|| {
            FleetError::ConnectionLost(
                server.to_string(),
                "server not running or unhealthy".to_string(),
            )
        })?;
        let session = connection.session().await?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        self.sink.tool_event(ToolExecutionEvent::Started {
            execution_id: execution_id.clone(),
            tool: name.to_string(),
            session_id,
        });
        let started = std::time::Instant::now();

        match session.call_tool(tool, args).await {
            Ok(result) if result.is_error => {
                let message = result.content.to_string();
                self.sink.tool_event(ToolExecutionEvent::Failed {
                    execution_id,
                    tool: name.to_string(),
                    error: message.clone(),
                });
                Err(FleetError::ToolExecutionError(name.to_string(), message))
            }
            Ok(result) => {
                self.sink.tool_event(ToolExecutionEvent::Completed {
                    execution_id,
                    tool: name.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(result.content)
            }
            Err(e) => {
                self.sink.tool_event(ToolExecutionEvent::Failed {
                    execution_id,
                    tool: name.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// The `default`-mode passthrough: forward the query to the host's
    /// language-model adapter.
    async fn ask_cipher(&self, args: Value) -> crate::Result<Value> {
        let query = args.get("query").and_then(|v| v.as_str()).ok_or_else(|| {
            FleetError::ToolValidationError(ASK_CIPHER.to_string(), "missing 'query' string".into())
        })?;
        let llm = self.internal.services().llm.clone().ok_or_else(|| {
            FleetError::ToolExecutionError(ASK_CIPHER.to_string(), "llm adapter unavailable".into())
        })?;
        let response = llm.complete(query).await?;
        Ok(json!({"response": response}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::lifecycle::{ConnectionSettings, LifecycleConfig};
    use crate::testutil::fake_server_descriptor;
    use crate::tools::builtin::register_builtin_tools;
    use crate::tools::internal::{InternalToolRegistry, LlmService, ToolServices};
    use async_trait::async_trait;

    struct CannedLlm;

    #[async_trait]
    impl LlmService for CannedLlm {
        async fn complete(&self, prompt: &str) -> crate::Result<String> {
            Ok(format!("answer to: {prompt}"))
        }
    }

    fn internal_manager(services: ToolServices) -> Arc<InternalToolManager> {
        let registry = InternalToolRegistry::new();
        register_builtin_tools(&registry).unwrap();
        Arc::new(InternalToolManager::new(
            registry,
            Arc::new(services),
            Arc::new(NullSink),
        ))
    }

    fn fleet() -> Arc<LifecycleManager> {
        LifecycleManager::new(
            LifecycleConfig::default(),
            ConnectionSettings::default(),
            Arc::new(NullSink),
        )
    }

    fn unified(mode: OperatingMode, gate: EmbeddingGate) -> UnifiedToolManager {
        UnifiedToolManager::new(
            fleet(),
            internal_manager(ToolServices::default()),
            mode,
            gate,
            Arc::new(NullSink),
        )
    }

    fn names(tools: &[ToolDescriptor]) -> Vec<&str> {
        tools.iter().map(|t| t.name.as_str()).collect()
    }

    fn internal_only(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({"type": "object"}),
            source: ToolSource::Internal,
            agent_accessible: true,
            category: None,
            requires_embeddings: false,
        }
    }

    fn external_only(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            source: ToolSource::External {
                server: "srv".to_string(),
            },
            ..internal_only(name)
        }
    }

    #[tokio::test]
    async fn test_default_mode_exposes_only_ask_cipher() {
        let manager = unified(OperatingMode::Default, EmbeddingGate::default());
        let tools = manager.all_tools().await.unwrap();
        assert_eq!(names(&tools), vec![ASK_CIPHER]);
    }

    #[tokio::test]
    async fn test_default_mode_rejects_other_tools() {
        let manager = unified(OperatingMode::Default, EmbeddingGate::default());
        let result = manager
            .execute_tool("cipher_memory_search", json!({"query": "x"}), None)
            .await;
        assert!(matches!(result, Err(FleetError::ToolNotAllowed(_, _))));
    }

    #[tokio::test]
    async fn test_ask_cipher_uses_llm_service() {
        let manager = UnifiedToolManager::new(
            fleet(),
            internal_manager(ToolServices {
                llm: Some(Arc::new(CannedLlm)),
                ..ToolServices::default()
            }),
            OperatingMode::Default,
            EmbeddingGate::default(),
            Arc::new(NullSink),
        );
        let result = manager
            .execute_tool(ASK_CIPHER, json!({"query": "ping?"}), None)
            .await
            .unwrap();
        assert_eq!(result["response"], "answer to: ping?");
    }

    #[tokio::test]
    async fn test_ask_cipher_without_llm_is_execution_error() {
        let manager = unified(OperatingMode::Default, EmbeddingGate::default());
        let result = manager
            .execute_tool(ASK_CIPHER, json!({"query": "ping?"}), None)
            .await;
        assert!(matches!(result, Err(FleetError::ToolExecutionError(_, _))));
    }

    #[tokio::test]
    async fn test_api_mode_lists_agent_accessible_internals() {
        let manager = unified(OperatingMode::Api, EmbeddingGate::default());
        let tools = manager.all_tools().await.unwrap();
        assert_eq!(
            names(&tools),
            vec![
                "cipher_knowledge_query",
                "cipher_memory_search",
                "cipher_store_memory"
            ]
        );
    }

    #[tokio::test]
    async fn test_cli_mode_filters_to_search_and_memory() {
        let manager = unified(OperatingMode::Cli, EmbeddingGate::default());
        let tools = manager.all_tools().await.unwrap();
        assert_eq!(
            names(&tools),
            vec!["cipher_memory_search", "cipher_store_memory"]
        );
    }

    #[tokio::test]
    async fn test_aggregator_mode_includes_inaccessible_tools() {
        let manager = unified(OperatingMode::Aggregator, EmbeddingGate::default());
        let tools = manager.all_tools().await.unwrap();
        assert!(names(&tools).contains(&"cipher_extract_reasoning"));
        assert_eq!(tools.len(), 4);
    }

    #[tokio::test]
    async fn test_disabled_embeddings_hide_dependent_tools() {
        let gate = EmbeddingGate::new(false);
        let manager = unified(OperatingMode::Api, gate.clone());
        let tools = manager.all_tools().await.unwrap();
        assert_eq!(names(&tools), vec!["cipher_knowledge_query"]);

        gate.set_enabled(true);
        let tools = manager.all_tools().await.unwrap();
        assert_eq!(tools.len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_embeddings_block_dispatch() {
        let manager = unified(OperatingMode::Api, EmbeddingGate::new(false));
        let result = manager
            .execute_tool("cipher_memory_search", json!({"query": "x"}), None)
            .await;
        assert!(
            matches!(result, Err(FleetError::EmbeddingsDisabled(name)) if name == "cipher_memory_search")
        );
    }

    #[tokio::test]
    async fn test_inaccessible_internal_tool_blocked_outside_aggregator() {
        let manager = unified(OperatingMode::Api, EmbeddingGate::default());
        let result = manager
            .execute_tool("cipher_extract_reasoning", json!({"text": "because"}), None)
            .await;
        assert!(matches!(result, Err(FleetError::ToolNotAllowed(_, _))));
    }

    #[tokio::test]
    async fn test_external_tools_namespaced_and_called() {
        let lifecycle = fleet();
        lifecycle
            .start_connection(fake_server_descriptor("echo"))
            .await
            .unwrap();

        let manager = UnifiedToolManager::new(
            lifecycle.clone(),
            internal_manager(ToolServices::default()),
            OperatingMode::Api,
            EmbeddingGate::default(),
            Arc::new(NullSink),
        );

        let tools = manager.all_tools().await.unwrap();
        assert!(names(&tools).contains(&"echo/ping"));

        let result = manager
            .execute_tool("echo/ping", json!({"x": 1}), None)
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        lifecycle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_external_server_is_reported() {
        let manager = unified(OperatingMode::Api, EmbeddingGate::default());
        let result = manager
            .execute_tool("nowhere/ping", json!({}), None)
            .await;
        assert!(matches!(result, Err(FleetError::ConnectionLost(server, _)) if server == "nowhere"));

        let result = manager.execute_tool("bare-name", json!({}), None).await;
        assert!(matches!(result, Err(FleetError::ToolNotFound(_))));
    }

    #[test]
    fn test_conflict_prefix_internal_keeps_both() {
        let merged = resolve_conflicts(
            vec![external_only("x"), external_only("y")],
            vec![internal_only("x")],
            ConflictResolution::PrefixInternal,
        )
        .unwrap();
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_conflict_prefer_internal_drops_external() {
        let merged = resolve_conflicts(
            vec![external_only("x"), external_only("y")],
            vec![internal_only("x")],
            ConflictResolution::PreferInternal,
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
        assert!(
            merged
                .iter()
                .find(|t| t.name == "x")
                .map(|t| t.source == ToolSource::Internal)
                .unwrap()
        );
    }

    #[test]
    fn test_conflict_prefer_mcp_drops_internal() {
        let merged = resolve_conflicts(
            vec![external_only("x")],
            vec![internal_only("x"), internal_only("z")],
            ConflictResolution::PreferMcp,
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
        assert!(
            merged
                .iter()
                .find(|t| t.name == "x")
                .map(|t| matches!(t.source, ToolSource::External { .. }))
                .unwrap()
        );
    }

    #[test]
    fn test_conflict_error_fails_catalog() {
        let result = resolve_conflicts(
            vec![external_only("x")],
            vec![internal_only("x")],
            ConflictResolution::Error,
        );
        assert!(matches!(result, Err(FleetError::ConfigInvalid(_, msg)) if msg.contains("x")));
    }
}
