//! Completion request/response model shared with the `Completer`.

use nanobot_types::{CallToolResult, Content};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item of model input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionItem {
    Message {
        id: String,
        role: String,
        content: Vec<Content>,
    },
    ToolCall {
        id: String,
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        output: CallToolResult,
    },
}

impl CompletionItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        CompletionItem::Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: "user".to_string(),
            content: vec![Content::text(text)],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        CompletionItem::Message {
            id: uuid::Uuid::new_v4().to_string(),
            role: "assistant".to_string(),
            content: vec![Content::text(text)],
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        match self {
            CompletionItem::Message { id, .. } => Some(id),
            CompletionItem::ToolCall { id, .. } => Some(id),
            CompletionItem::ToolResult { .. } => None,
        }
    }
}

/// A tool as presented to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// The abstract request handed to a [`crate::Completer`]; provider-specific
/// translation happens outside the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// Agent (and thereby model) the request targets.
    pub agent: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: Vec<CompletionItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(default)]
    pub new_thread: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub output: Vec<CompletionItem>,
    #[serde(default)]
    pub model: String,
}

impl CompletionResponse {
    /// The tool-call items in this response.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.output
            .iter()
            .filter_map(|item| match item {
                CompletionItem::ToolCall {
                    call_id,
                    name,
                    arguments,
                    ..
                } => Some((call_id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text of assistant messages.
    pub fn assistant_text(&self) -> String {
        let mut out = String::new();
        for item in &self.output {
            if let CompletionItem::Message { role, content, .. } = item {
                if role == "assistant" {
                    for piece in content {
                        if let Some(text) = piece.as_text() {
                            if !out.is_empty() {
                                out.push('\n');
                            }
                            out.push_str(text);
                        }
                    }
                }
            }
        }
        out
    }
}

/// One completed (or pending) tool dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutput {
    pub done: bool,
    pub output: CallToolResult,
}

/// Which mapped tools a turn may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolIncludeContext {
    #[default]
    All,
    /// Drop every tool.
    None,
    /// Keep only tools owned by `tool_source`.
    ThisServer,
}

/// Per-call options that never persist with the execution.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub progress_token: Option<Value>,
    /// Chat-shaped turn: input is a user prompt, output is surfaced as a
    /// tool result.
    pub chat: bool,
    pub tool_include: ToolIncludeContext,
    pub tool_source: Option<String>,
    /// Caller-supplied one-off tools; calls against them surface back to
    /// the caller instead of dispatching downstream.
    pub external_tools: Vec<(String, nanobot_tools::ToolMapping)>,
}
