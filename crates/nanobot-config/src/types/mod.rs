//! Configuration types.
//!
//! One file per configuration area; the root [`Config`] composes them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod agents;
mod hooks;
mod prompts;
mod publish;
mod servers;

pub use agents::{Agent, AgentOutput, Instructions, ToolChoice};
pub use hooks::HookConfig;
pub use prompts::PromptConfig;
pub use publish::Publish;
pub use servers::{McpServer, ServerOAuth};

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Agents addressable by name.
    #[serde(default)]
    pub agents: BTreeMap<String, Agent>,
    /// Downstream ATP servers addressable by name.
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServer>,
    /// Locally defined prompts.
    #[serde(default)]
    pub prompts: BTreeMap<String, PromptConfig>,
    /// Message-interception hooks, in registration order.
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
    /// What this instance publishes over its own ATP endpoint.
    #[serde(default)]
    pub publish: Publish,
}

impl Config {
    /// The agent driven by the built-in `chat` tool: the one flagged
    /// `chat: true`, or the sole configured agent.
    pub fn chat_agent(&self) -> Option<(&String, &Agent)> {
        if let Some(entry) = self.agents.iter().find(|(_, a)| a.chat) {
            return Some(entry);
        }
        if self.agents.len() == 1 {
            return self.agents.iter().next();
        }
        None
    }
}
