//! Provider-specific schema formatting.
//!
//! Translates the generic catalog into the function-calling shape each
//! downstream model adapter expects. Structural remap only — names,
//! descriptions, and parameter schemas pass through unchanged.

use crate::tools::ToolDescriptor;
use serde::Deserialize;
use serde_json::{Value, json};

/// Supported downstream schema dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

/// Format the catalog for one provider.
///
/// OpenAI and Anthropic get one object per tool; Gemini gets a single
/// wrapper object holding every function declaration.
pub fn format_for_provider(tools: &[ToolDescriptor], kind: ProviderKind) -> Vec<Value> {
    match kind {
        ProviderKind::OpenAi => tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect(),
        ProviderKind::Anthropic => tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect(),
        ProviderKind::Gemini => {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            vec![json!({"functionDeclarations": declarations})]
        }
    }
}
