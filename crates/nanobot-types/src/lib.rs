//! Core wire types for the Agent-Tool Protocol (ATP).
//!
//! ATP is JSON-RPC 2.0 over a single HTTP endpoint with an SSE side-channel.
//! This crate defines the message envelope, the tagged content variants, the
//! protocol records for every core method, and the error carriers shared by
//! every other nanobot crate. It deliberately has no I/O dependencies.

mod content;
mod error;
mod protocol;
mod rpc;
mod schema;

pub use content::{Annotations, Content, ResourceContents};
pub use error::CoreError;
pub use protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ElicitParams, ElicitResult,
    GetPromptParams, GetPromptResult, Implementation, InitializeRequest, InitializeResult,
    ListPromptsResult, ListResourcesResult, ListToolsResult, ProgressParams, Prompt,
    PromptArgument, PromptMessage, ReadResourceParams, ReadResourceResult, Resource,
    SamplingMessage, SamplingParams, SamplingResult, ServerCapabilities, SubscribeParams, Tool,
};
pub use rpc::{error_codes, parse_message, Message, RequestId, RpcError, SESSION_ID_HEADER};
pub use schema::{ensure_object_schema, fix_schema};
