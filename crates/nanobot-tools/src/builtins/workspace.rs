//! Forwarder for `workspace://` URIs and workspace tools.
//!
//! The workspace server itself is external (it fronts the sandbox); this
//! side only speaks its wire contract through the declared `workspace`
//! server entry.

use std::sync::Arc;

use nanobot_session::Session;
use nanobot_types::{CallToolResult, CoreError, ReadResourceResult, Tool};
use serde_json::{json, Value};

use crate::registry::ToolRegistry;

pub const WORKSPACE_SERVER: &str = "workspace";

pub struct WorkspaceForwarder;

impl WorkspaceForwarder {
    fn ensure_declared(registry: &ToolRegistry) -> Result<(), CoreError> {
        if registry.config().mcp_servers.contains_key(WORKSPACE_SERVER) {
            Ok(())
        } else {
            Err(CoreError::invalid_params(
                "no workspace server is configured",
            ))
        }
    }

    pub async fn read(
        registry: &ToolRegistry,
        session: &Arc<Session>,
        uri: &str,
    ) -> Result<ReadResourceResult, CoreError> {
        Self::ensure_declared(registry)?;
        let client = registry.client_for(session, WORKSPACE_SERVER).await?;
        let value = client.exchange("resources/read", json!({"uri": uri})).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_tools(
        registry: &ToolRegistry,
        session: &Arc<Session>,
    ) -> Result<Vec<Tool>, CoreError> {
        Self::ensure_declared(registry)?;
        let client = registry.client_for(session, WORKSPACE_SERVER).await?;
        let value = client.exchange("tools/list", json!({})).await?;
        let listed: nanobot_types::ListToolsResult = serde_json::from_value(value)?;
        Ok(listed.tools)
    }

    pub async fn call(
        registry: &ToolRegistry,
        session: &Arc<Session>,
        tool: &str,
        arguments: Value,
        meta: Option<Value>,
    ) -> Result<CallToolResult, CoreError> {
        Self::ensure_declared(registry)?;
        let client = registry.client_for(session, WORKSPACE_SERVER).await?;
        let mut params = json!({"name": tool, "arguments": arguments});
        if let Some(meta) = meta {
            params["_meta"] = meta;
        }
        let value = client.exchange("tools/call", params).await?;
        Ok(serde_json::from_value(value)?)
    }
}
