//! Configuration document consumed by the nanobot runtime.
//!
//! Loading (YAML files, includes, watching) is the front-end's job; this
//! crate defines the typed document, environment-variable expansion over it,
//! and semantic validation. The runtime receives a fully rendered
//! [`Config`] value.

mod env;
pub mod types;
mod validation;

pub use env::expand_env_vars;
pub use types::{
    Agent, AgentOutput, Config, HookConfig, Instructions, McpServer, PromptConfig, Publish,
    ServerOAuth, ToolChoice,
};
pub use validation::ValidationError;
