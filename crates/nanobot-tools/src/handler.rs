//! The per-session message handler tree.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nanobot_config::Config;
use nanobot_session::{MessageHandler, ResourceStore, Session, SessionStore};
use nanobot_types::{
    CallToolParams, CallToolResult, CoreError, GetPromptParams, GetPromptResult,
    InitializeRequest, InitializeResult, Implementation, ListPromptsResult, ListResourcesResult,
    ListToolsResult, Message, Prompt, PromptMessage, ReadResourceParams, ServerCapabilities,
    SubscribeParams, Tool,
};
use serde_json::{json, Value};
use tracing::debug;

use crate::builtins::{metadata, meta_tools, ResourcesServer, WorkspaceForwarder};
use crate::registry::{BuiltinRouter, ToolMapping, ToolRegistry};

/// One `chat` tool invocation, handed to the agent layer.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub agent: String,
    pub prompt: String,
    pub attachments: Vec<Value>,
    pub progress_token: Option<Value>,
    pub async_call: bool,
}

/// Drives the agent engine. Implemented by the agent crate and injected so
/// this crate never depends on it.
#[async_trait]
pub trait ChatDriver: Send + Sync {
    async fn chat(
        &self,
        session: &Arc<Session>,
        request: ChatRequest,
    ) -> Result<CallToolResult, CoreError>;
}

/// Routing handler behind the inbound ATP endpoint.
pub struct HandlerTree {
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
    resources: ResourcesServer,
    chat: RwLock<Option<Arc<dyn ChatDriver>>>,
}

impl HandlerTree {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ToolRegistry>,
        resource_store: Arc<ResourceStore>,
        session_store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            registry,
            resources: ResourcesServer::new(resource_store, session_store),
            chat: RwLock::new(None),
        }
    }

    pub fn set_chat_driver(&self, driver: Arc<dyn ChatDriver>) {
        *self.chat.write().expect("lock") = Some(driver);
    }

    fn chat_driver(&self) -> Result<Arc<dyn ChatDriver>, CoreError> {
        self.chat
            .read()
            .expect("lock")
            .clone()
            .ok_or_else(|| CoreError::internal("chat driver not wired"))
    }

    fn chat_agent(&self) -> Result<String, CoreError> {
        self.config
            .chat_agent()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| CoreError::invalid_params("no chat agent configured"))
    }

    fn chat_tool(&self) -> Tool {
        Tool {
            name: "chat".to_string(),
            description: Some("Send a prompt to the configured agent.".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "attachments": {"type": "array", "items": {"type": "object"}}
                },
                "required": ["prompt"],
                "additionalProperties": false
            }),
            ..Default::default()
        }
    }

    /// Tools this instance publishes: the built-in `chat` tool plus any
    /// references listed under `publish.tools`.
    async fn published_tools(
        &self,
        session: &Arc<Session>,
    ) -> Result<Vec<(String, ToolMapping)>, CoreError> {
        let mut out = Vec::new();
        if self.config.chat_agent().is_some() {
            out.push((
                "chat".to_string(),
                ToolMapping {
                    mcp_server: "agents".to_string(),
                    target_name: "chat".to_string(),
                    tool: self.chat_tool(),
                    external: false,
                },
            ));
        }
        if !self.config.publish.tools.is_empty() {
            out.extend(
                self.registry
                    .build_tool_mappings(session, &self.config.publish.tools)
                    .await?,
            );
        }
        Ok(out)
    }

    async fn handle_initialize(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<Option<Value>, CoreError> {
        let request: InitializeRequest = msg.parse_params()?;
        let result = InitializeResult {
            protocol_version: request.protocol_version.clone(),
            capabilities: ServerCapabilities {
                tools: Some(json!({"listChanged": false})),
                prompts: Some(json!({})),
                resources: Some(json!({"subscribe": true})),
                logging: Some(json!({})),
                experimental: None,
            },
            server_info: Implementation {
                name: if self.config.publish.name.is_empty() {
                    "nanobot".to_string()
                } else {
                    self.config.publish.name.clone()
                },
                version: if self.config.publish.version.is_empty() {
                    env!("CARGO_PKG_VERSION").to_string()
                } else {
                    self.config.publish.version.clone()
                },
            },
            instructions: self.config.publish.instructions.clone(),
            meta: None,
        };
        session.set_initialize(request, result.clone());
        Ok(Some(serde_json::to_value(result)?))
    }

    async fn handle_tools_call(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<Option<Value>, CoreError> {
        let params: CallToolParams = msg.parse_params()?;
        let progress_token = msg.progress_token();
        let async_call = params
            .meta
            .as_ref()
            .and_then(|m| m.get("ai.nanobot.async"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let outcome = match params.name.as_str() {
            "chat" => {
                let request = ChatRequest {
                    agent: self.chat_agent()?,
                    prompt: params
                        .arguments
                        .get("prompt")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    attachments: params
                        .arguments
                        .get("attachments")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    progress_token,
                    async_call,
                };
                self.chat_driver()?.chat(session, request).await
            }
            "create_resource" | "delete_resource" => {
                self.resources
                    .call(session, &params.name, params.arguments.clone())
                    .await
            }
            "describe" => Ok(CallToolResult {
                is_error: false,
                content: vec![nanobot_types::Content::text("nanobot")],
                structured_content: Some(metadata(&self.config)),
            }),
            other => {
                let published = self.published_tools(session).await?;
                let mapping = published
                    .iter()
                    .find(|(name, _)| name == other)
                    .map(|(_, mapping)| mapping.clone())
                    .ok_or_else(|| {
                        CoreError::invalid_params(format!("unknown tool {:?}", other))
                    })?;
                self.registry
                    .call(
                        session,
                        &mapping.mcp_server,
                        &mapping.target_name,
                        params.arguments.clone(),
                        async_call,
                        progress_token,
                    )
                    .await
            }
        };

        // A tool failure is data for the caller, not a transport error; only
        // auth challenges and hook rejections keep their error shape.
        let result = match outcome {
            Ok(result) => result,
            Err(err @ CoreError::AuthRequired { .. }) => return Err(err),
            Err(err @ CoreError::HookRejected { .. }) => return Err(err),
            Err(err) => CallToolResult::error(err.to_string()),
        };
        Ok(Some(serde_json::to_value(result)?))
    }

    async fn handle_resources_read(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<Option<Value>, CoreError> {
        let params: ReadResourceParams = msg.parse_params()?;
        let result = if params.uri.starts_with("workspace://") {
            WorkspaceForwarder::read(&self.registry, session, &params.uri).await?
        } else {
            self.resources.read(session, &params.uri).await?
        };
        Ok(Some(serde_json::to_value(result)?))
    }

    async fn handle_prompts_get(&self, msg: &Message) -> Result<Option<Value>, CoreError> {
        let params: GetPromptParams = msg.parse_params()?;
        let prompt = self.config.prompts.get(&params.name).ok_or_else(|| {
            CoreError::invalid_params(format!("unknown prompt {:?}", params.name))
        })?;
        let result = GetPromptResult {
            description: prompt.description.clone(),
            messages: vec![PromptMessage {
                role: "user".to_string(),
                content: nanobot_types::Content::text(prompt.render(&params.arguments)),
            }],
        };
        Ok(Some(serde_json::to_value(result)?))
    }
}

#[async_trait]
impl MessageHandler for HandlerTree {
    async fn handle(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<Option<Value>, CoreError> {
        match msg.method_name() {
            "initialize" => self.handle_initialize(session, msg).await,
            "notifications/initialized" | "notifications/progress" | "notifications/message" => {
                Ok(None)
            }
            "ping" => Ok(Some(json!({}))),
            "tools/list" => {
                let tools: Vec<Tool> = self
                    .published_tools(session)
                    .await?
                    .into_iter()
                    .map(|(name, mapping)| Tool {
                        name,
                        ..mapping.tool
                    })
                    .collect();
                Ok(Some(serde_json::to_value(ListToolsResult { tools })?))
            }
            "tools/call" => self.handle_tools_call(session, msg).await,
            "prompts/list" => {
                let prompts: Vec<Prompt> = self
                    .config
                    .prompts
                    .iter()
                    .map(|(name, prompt)| Prompt {
                        name: name.clone(),
                        description: prompt.description.clone(),
                        arguments: prompt.arguments.clone(),
                    })
                    .collect();
                Ok(Some(serde_json::to_value(ListPromptsResult { prompts })?))
            }
            "prompts/get" => self.handle_prompts_get(msg).await,
            "resources/list" => {
                let resources = self.resources.list(session)?;
                Ok(Some(serde_json::to_value(ListResourcesResult {
                    resources,
                })?))
            }
            "resources/read" => self.handle_resources_read(session, msg).await,
            "resources/subscribe" => {
                let params: SubscribeParams = msg.parse_params()?;
                self.resources.subscribe(session, &params.uri);
                Ok(Some(json!({})))
            }
            "resources/unsubscribe" => {
                let params: SubscribeParams = msg.parse_params()?;
                self.resources.unsubscribe(session, &params.uri);
                Ok(Some(json!({})))
            }
            "resources/templates/list" => Ok(Some(json!({"resourceTemplates": []}))),
            "logging/setLevel" => Ok(Some(json!({}))),
            "sampling/createMessage" => {
                let sampler = self
                    .registry
                    .sampler()
                    .ok_or_else(|| CoreError::internal("no sampler registered"))?;
                let result = sampler.create_message(session, msg.parse_params()?).await?;
                Ok(Some(serde_json::to_value(result)?))
            }
            "elicitation/create" => {
                // Nothing interactive fronts this session; decline rather
                // than stall the downstream caller.
                debug!(session = session.id(), "declining elicitation request");
                Ok(Some(json!({"action": "decline"})))
            }
            "roots/list" => Ok(Some(json!({"roots": []}))),
            other => Err(CoreError::method_not_found(other)),
        }
    }
}

#[async_trait]
impl BuiltinRouter for HandlerTree {
    async fn call_builtin(
        &self,
        session: &Arc<Session>,
        server: &str,
        tool: &str,
        arguments: Value,
        meta: Option<Value>,
    ) -> Result<CallToolResult, CoreError> {
        match server {
            "agents" => {
                let agent = if tool == "chat" {
                    self.chat_agent()?
                } else {
                    tool.to_string()
                };
                let request = ChatRequest {
                    agent,
                    prompt: arguments
                        .get("prompt")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    attachments: arguments
                        .get("attachments")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    progress_token: meta
                        .as_ref()
                        .and_then(|m| m.get("progressToken"))
                        .cloned(),
                    async_call: meta
                        .as_ref()
                        .and_then(|m| m.get("ai.nanobot.async"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                };
                self.chat_driver()?.chat(session, request).await
            }
            "resources" => self.resources.call(session, tool, arguments).await,
            "workspace" => {
                WorkspaceForwarder::call(&self.registry, session, tool, arguments, meta).await
            }
            "meta" => match tool {
                "describe" => Ok(CallToolResult {
                    is_error: false,
                    content: vec![nanobot_types::Content::text("nanobot")],
                    structured_content: Some(metadata(&self.config)),
                }),
                other => Err(CoreError::invalid_params(format!(
                    "meta server has no tool {:?}",
                    other
                ))),
            },
            other => Err(CoreError::invalid_params(format!(
                "unknown built-in server {:?}",
                other
            ))),
        }
    }

    async fn list_builtin(
        &self,
        session: &Arc<Session>,
        server: &str,
    ) -> Result<Vec<Tool>, CoreError> {
        match server {
            "agents" => {
                let mut tools = vec![self.chat_tool()];
                for name in self.config.agents.keys() {
                    tools.push(Tool {
                        name: name.clone(),
                        description: Some(format!("Invoke the {} agent.", name)),
                        input_schema: json!({
                            "type": "object",
                            "properties": {"prompt": {"type": "string"}},
                            "required": ["prompt"],
                            "additionalProperties": false
                        }),
                        ..Default::default()
                    });
                }
                Ok(tools)
            }
            "resources" => Ok(self.resources.tools()),
            "workspace" => WorkspaceForwarder::list_tools(&self.registry, session).await,
            "meta" => Ok(meta_tools()),
            other => Err(CoreError::invalid_params(format!(
                "unknown built-in server {:?}",
                other
            ))),
        }
    }
}
