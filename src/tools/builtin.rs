//! Built-in internal tools.
//!
//! Each tool is a handler closure over the [`ToolServices`] bundle it
//! receives per execution; a missing service surfaces as a
//! `ToolExecutionError` from the tool itself. Embedding-dependent tools
//! declare it so the unified catalog can hide them when embeddings are
//! globally disabled.

use crate::error::FleetError;
use crate::tools::internal::{InternalToolRegistry, InternalToolSpec, ToolContext};
use serde_json::{Value, json};
use std::sync::Arc;

fn require_str(args: &Value, key: &str, tool: &str) -> crate::Result<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            FleetError::ToolValidationError(tool.to_string(), format!("missing '{key}' string"))
        })
}

async fn memory_search(args: Value, ctx: ToolContext) -> crate::Result<Value> {
    let query = require_str(&args, "query", &ctx.tool_name)?;
    let top_k = args.get("top_k").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

    let embeddings = ctx.services.embeddings.as_ref().ok_or_else(|| {
        FleetError::ToolExecutionError(ctx.tool_name.clone(), "embedding service unavailable".into())
    })?;
    let store = ctx.services.vector_store.as_ref().ok_or_else(|| {
        FleetError::ToolExecutionError(ctx.tool_name.clone(), "vector store unavailable".into())
    })?;

    let vector = embeddings.embed(&query).await?;
    let hits = store.search(&vector, top_k).await?;
    Ok(json!({"query": query, "results": hits}))
}

async fn store_memory(args: Value, ctx: ToolContext) -> crate::Result<Value> {
    let text = require_str(&args, "text", &ctx.tool_name)?;

    let embeddings = ctx.services.embeddings.as_ref().ok_or_else(|| {
        FleetError::ToolExecutionError(ctx.tool_name.clone(), "embedding service unavailable".into())
    })?;
    let store = ctx.services.vector_store.as_ref().ok_or_else(|| {
        FleetError::ToolExecutionError(ctx.tool_name.clone(), "vector store unavailable".into())
    })?;

    let vector = embeddings.embed(&text).await?;
    let id = store
        .insert(&vector, json!({"text": text, "session_id": ctx.session_id}))
        .await?;
    Ok(json!({"stored": true, "id": id}))
}

async fn extract_reasoning(args: Value, ctx: ToolContext) -> crate::Result<Value> {
    let text = require_str(&args, "text", &ctx.tool_name)?;

    let llm = ctx.services.llm.as_ref().ok_or_else(|| {
        FleetError::ToolExecutionError(ctx.tool_name.clone(), "llm adapter unavailable".into())
    })?;

    let prompt = format!(
        "Extract the reasoning steps from the following text as a numbered list.\n\n{text}"
    );
    let steps = llm.complete(&prompt).await?;
    Ok(json!({"reasoning": steps}))
}

async fn knowledge_query(args: Value, ctx: ToolContext) -> crate::Result<Value> {
    let query = require_str(&args, "query", &ctx.tool_name)?;

    let graph = ctx.services.knowledge_graph.as_ref().ok_or_else(|| {
        FleetError::ToolExecutionError(ctx.tool_name.clone(), "knowledge graph unavailable".into())
    })?;

    let result = graph.query(&query).await?;
    Ok(json!({"query": query, "result": result}))
}

/// Register the built-in tool set into the registry.
pub fn register_builtin_tools(registry: &InternalToolRegistry) -> crate::Result<()> {
    registry.register(InternalToolSpec {
        name: "memory_search".to_string(),
        category: "memory".to_string(),
        description: "Search stored memories by semantic similarity".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "top_k": {"type": "integer", "minimum": 1, "maximum": 50},
            },
            "required": ["query"],
        }),
        handler: Arc::new(|args, ctx| Box::pin(memory_search(args, ctx))),
        agent_accessible: true,
        version: 1,
        requires_embeddings: true,
    })?;

    registry.register(InternalToolSpec {
        name: "store_memory".to_string(),
        category: "memory".to_string(),
        description: "Persist a piece of text into the memory store".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        }),
        handler: Arc::new(|args, ctx| Box::pin(store_memory(args, ctx))),
        agent_accessible: true,
        version: 1,
        requires_embeddings: true,
    })?;

    registry.register(InternalToolSpec {
        name: "extract_reasoning".to_string(),
        category: "reasoning".to_string(),
        description: "Extract reasoning steps from free-form text".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        }),
        handler: Arc::new(|args, ctx| Box::pin(extract_reasoning(args, ctx))),
        // driven by the host's own pipeline, never exposed to agents
        agent_accessible: false,
        version: 1,
        requires_embeddings: false,
    })?;

    registry.register(InternalToolSpec {
        name: "knowledge_query".to_string(),
        category: "knowledge".to_string(),
        description: "Query the knowledge graph".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        }),
        handler: Arc::new(|args, ctx| Box::pin(knowledge_query(args, ctx))),
        agent_accessible: true,
        version: 1,
        requires_embeddings: false,
    })?;

    Ok(())
}
