//! The agent completion engine.
//!
//! A turn starts from configuration, the previous execution, and fresh user
//! input; the engine populates a completion request, streams partial output
//! as progress notifications, dispatches model-emitted tool calls through
//! the federation registry, weaves results back into the next request, and
//! loops until the model stops calling tools.

mod completer;
mod engine;
mod execution;
mod sampler;
mod types;
mod ui_action;

pub use completer::{Completer, ProgressSink};
pub use engine::AgentEngine;
pub use execution::Execution;
pub use sampler::EngineSampler;
pub use types::{
    CompletionItem, CompletionOptions, CompletionRequest, CompletionResponse, ToolCallOutput,
    ToolDef, ToolIncludeContext,
};
pub use ui_action::{sniff_ui_action, UiAction};
