//! Internal tool registry and manager.
//!
//! The registry is an explicit process-scoped container of built-in tools,
//! keyed by their `cipher_`-prefixed names; registration and lookup both
//! normalize first. The manager executes handlers under a timeout race,
//! validates arguments against each tool's declared JSON schema, keeps
//! per-tool statistics over a bounded ring of recent durations, and emits
//! execution events when a sink is configured.

use crate::error::FleetError;
use crate::events::{EventSink, ToolExecutionEvent};
use crate::tools::{ToolDescriptor, ToolSource, normalize_internal_name};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Recent-duration ring backing the average execution time.
const DURATION_RING_CAPACITY: usize = 100;

/// Default handler timeout.
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Embedding provider handle, supplied by the host when available.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>>;
}

/// One memory search hit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryHit {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// Vector store handle, supplied by the host when available.
#[async_trait]
pub trait VectorStoreService: Send + Sync {
    async fn search(&self, vector: &[f32], top_k: usize) -> crate::Result<Vec<MemoryHit>>;
    async fn insert(&self, vector: &[f32], payload: Value) -> crate::Result<String>;
}

/// Language-model adapter handle, supplied by the host when available.
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn complete(&self, prompt: &str) -> crate::Result<String>;
}

/// Knowledge graph handle, supplied by the host when available.
#[async_trait]
pub trait KnowledgeGraphService: Send + Sync {
    async fn query(&self, query: &str) -> crate::Result<Value>;
}

/// Declared bundle of host services handed to every tool execution.
/// Missing services arrive as `None`; the tool decides whether that is fatal.
#[derive(Clone, Default)]
pub struct ToolServices {
    pub embeddings: Option<Arc<dyn EmbeddingService>>,
    pub vector_store: Option<Arc<dyn VectorStoreService>>,
    pub llm: Option<Arc<dyn LlmService>>,
    pub knowledge_graph: Option<Arc<dyn KnowledgeGraphService>>,
}

/// Per-execution context handed to tool handlers.
pub struct ToolContext {
    pub tool_name: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub started_at: Instant,
    pub services: Arc<ToolServices>,
}

/// Handler closure: arbitrary JSON in, JSON out.
pub type ToolHandler =
    Arc<dyn Fn(Value, ToolContext) -> BoxFuture<'static, crate::Result<Value>> + Send + Sync>;

/// Registration payload for one internal tool.
pub struct InternalToolSpec {
    pub name: String,
    pub category: String,
    pub description: String,
    /// JSON schema the arguments are validated against.
    pub parameters: Value,
    pub handler: ToolHandler,
    pub agent_accessible: bool,
    pub version: u32,
    pub requires_embeddings: bool,
}

/// A registered tool, normalized and immutable.
pub struct RegisteredTool {
    pub name: String,
    pub category: String,
    pub description: String,
    pub parameters: Value,
    pub handler: ToolHandler,
    pub agent_accessible: bool,
    pub version: u32,
    pub requires_embeddings: bool,
}

impl RegisteredTool {
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            source: ToolSource::Internal,
            agent_accessible: self.agent_accessible,
            category: Some(self.category.clone()),
            requires_embeddings: self.requires_embeddings,
        }
    }
}

/// Process-scoped catalog of internal tools.
///
/// Created once at startup and handed to constructors — not a hidden
/// global. Clearing is only allowed during shutdown.
pub struct InternalToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl InternalToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: RwLock::new(HashMap::new()),
        })
    }

    /// Register a tool. Duplicates are rejected unless the new spec is a
    /// higher version of the same category.
    pub fn register(&self, spec: InternalToolSpec) -> crate::Result<()> {
        let name = normalize_internal_name(&spec.name);
        let mut tools = self.tools.write().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = tools.get(&name) {
            let supersedes =
                existing.category == spec.category && spec.version > existing.version;
            if !supersedes {
                return Err(FleetError::ConfigInvalid(
                    name,
                    "duplicate internal tool registration".to_string(),
                ));
            }
            tracing::info!(tool = %name, from = existing.version, to = spec.version, "superseding internal tool");
        }

        tools.insert(
            name.clone(),
            Arc::new(RegisteredTool {
                name,
                category: spec.category,
                description: spec.description,
                parameters: spec.parameters,
                handler: spec.handler,
                agent_accessible: spec.agent_accessible,
                version: spec.version,
                requires_embeddings: spec.requires_embeddings,
            }),
        );
        Ok(())
    }

    /// Look up by exact or unprefixed name.
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        let name = normalize_internal_name(name);
        self.tools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&name)
            .cloned()
    }

    /// Catalog view, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<ToolDescriptor> = tools.values().map(|t| t.descriptor()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the registry. Only legal during shutdown.
    pub fn clear(&self, shutting_down: bool) -> crate::Result<()> {
        if !shutting_down {
            return Err(FleetError::ToolNotAllowed(
                "registry".to_string(),
                "clear is only allowed during shutdown".to_string(),
            ));
        }
        self.tools
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        Ok(())
    }
}

/// Per-tool execution statistics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time_ms: f64,
    pub last_execution_unix_ms: Option<u64>,
}

#[derive(Default)]
struct StatsInner {
    stats: ExecutionStats,
    durations: VecDeque<u64>,
}

impl StatsInner {
    fn record_success(&mut self, duration_ms: u64, now_unix_ms: u64) {
        self.stats.total_executions += 1;
        self.stats.successful_executions += 1;
        self.stats.last_execution_unix_ms = Some(now_unix_ms);
        if self.durations.len() >= DURATION_RING_CAPACITY {
            self.durations.pop_front();
        }
        self.durations.push_back(duration_ms);
        let sum: u64 = self.durations.iter().sum();
        self.stats.average_execution_time_ms = sum as f64 / self.durations.len() as f64;
    }

    fn record_failure(&mut self, now_unix_ms: u64) {
        self.stats.total_executions += 1;
        self.stats.failed_executions += 1;
        self.stats.last_execution_unix_ms = Some(now_unix_ms);
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Validate tool arguments against the declared JSON schema.
fn validate_args(tool: &str, schema: &Value, args: &Value) -> crate::Result<()> {
    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| {
        FleetError::ToolValidationError(tool.to_string(), format!("unusable schema: {e}"))
    })?;
    if let Err(errors) = compiled.validate(args) {
        let detail: Vec<String> = errors.take(3).map(|e| e.to_string()).collect();
        return Err(FleetError::ToolValidationError(
            tool.to_string(),
            detail.join("; "),
        ));
    }
    Ok(())
}

/// Timeout-bounded dispatcher over the internal registry.
pub struct InternalToolManager {
    registry: Arc<InternalToolRegistry>,
    services: Arc<ToolServices>,
    stats: Mutex<HashMap<String, StatsInner>>,
    execution_timeout: Duration,
    sink: Arc<dyn EventSink>,
}

impl InternalToolManager {
    pub fn new(
        registry: Arc<InternalToolRegistry>,
        services: Arc<ToolServices>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            services,
            stats: Mutex::new(HashMap::new()),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            sink,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<InternalToolRegistry> {
        &self.registry
    }

    pub fn services(&self) -> Arc<ToolServices> {
        self.services.clone()
    }

    pub fn stats_for(&self, name: &str) -> Option<ExecutionStats> {
        let name = normalize_internal_name(name);
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&name)
            .map(|inner| inner.stats.clone())
    }

    /// Execute one internal tool: normalize, look up, validate, race the
    /// handler against the timeout, account the outcome.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        session_id: Option<String>,
    ) -> crate::Result<Value> {
        let name = normalize_internal_name(name);
        let tool = self
            .registry
            .get(&name)
            .ok_or_else(|| FleetError::ToolNotFound(name.clone()))?;

        validate_args(&name, &tool.parameters, &args)?;

        let execution_id = uuid::Uuid::new_v4().to_string();
        self.sink.tool_event(ToolExecutionEvent::Started {
            execution_id: execution_id.clone(),
            tool: name.clone(),
            session_id: session_id.clone(),
        });

        let context = ToolContext {
            tool_name: name.clone(),
            session_id,
            user_id: None,
            started_at: Instant::now(),
            services: self.services.clone(),
        };

        let started = Instant::now();
        let handler = tool.handler.clone();
        let outcome = match tokio::time::timeout(self.execution_timeout, handler(args, context))
            .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(FleetError::TimeoutExceeded(
                name.clone(),
                self.execution_timeout.as_millis() as u64,
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        let entry = stats.entry(name.clone()).or_default();
        match &outcome {
            Ok(_) => {
                entry.record_success(duration_ms, now_unix_ms());
                drop(stats);
                self.sink.tool_event(ToolExecutionEvent::Completed {
                    execution_id,
                    tool: name,
                    duration_ms,
                });
            }
            Err(e) => {
                entry.record_failure(now_unix_ms());
                drop(stats);
                tracing::warn!(tool = %name, error = %e, "internal tool failed");
                self.sink.tool_event(ToolExecutionEvent::Failed {
                    execution_id,
                    tool: name,
                    error: e.to_string(),
                });
            }
        }

        outcome
    }
}
