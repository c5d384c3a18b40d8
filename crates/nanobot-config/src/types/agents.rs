//! Agent definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent instructions: inline text, or a reference to a prompt on a server
/// resolved through `prompts/get` at request-population time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instructions {
    Text(String),
    PromptRef {
        #[serde(rename = "mcpServer")]
        mcp_server: String,
        prompt: String,
        #[serde(default)]
        args: Value,
    },
}

impl Default for Instructions {
    fn default() -> Self {
        Instructions::Text(String::new())
    }
}

/// Tool-choice hint forwarded to the completer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named { name: String },
}

/// Structured-output request: either a field list shorthand or a full
/// JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default)]
    pub strict: bool,
}

/// One configured agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub instructions: Instructions,
    /// Tool references, `server[/tool][:alias]`.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Other agents this agent may call as tools.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Servers whose entire tool catalogue this agent may use.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    /// Hook tags this agent's turns are additionally matched against.
    #[serde(default)]
    pub hooks: Vec<String>,
    /// Marks the agent driven by the built-in `chat` tool.
    #[serde(default)]
    pub chat: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instructions_inline_text() {
        let a: Agent = serde_json::from_value(json!({
            "model": "small",
            "instructions": "be brief"
        }))
        .unwrap();
        assert_eq!(a.instructions, Instructions::Text("be brief".into()));
    }

    #[test]
    fn test_instructions_prompt_ref() {
        let a: Agent = serde_json::from_value(json!({
            "instructions": {"mcpServer": "docs", "prompt": "system", "args": {"tone": "dry"}}
        }))
        .unwrap();
        match a.instructions {
            Instructions::PromptRef { mcp_server, prompt, args } => {
                assert_eq!(mcp_server, "docs");
                assert_eq!(prompt, "system");
                assert_eq!(args["tone"], "dry");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tool_choice_forms() {
        let a: Agent = serde_json::from_value(json!({"toolChoice": "auto"})).unwrap();
        assert_eq!(a.tool_choice, Some(ToolChoice::Mode("auto".into())));
        let b: Agent = serde_json::from_value(json!({"toolChoice": {"name": "search"}})).unwrap();
        assert_eq!(b.tool_choice, Some(ToolChoice::Named { name: "search".into() }));
    }
}
