//! The federation registry: one namespaced tool surface over many servers.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use nanobot_config::Config;
use nanobot_hooks::Direction;
use nanobot_session::{AttrKey, Session};
use nanobot_types::{
    ensure_object_schema, CallToolResult, CoreError, ListToolsResult, Message, Tool,
};
use nanobot_wire::{CallbackState, Client, ClientConfig, ClientOAuth};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::builtins::BUILTIN_SERVERS;
use crate::sampler::Sampler;

/// Bound on concurrent downstream work: listing fan-out and tool dispatch.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Session attribute carrying the caller's bearer, forwarded to downstream
/// wires for token exchange.
pub const SUBJECT_TOKEN_ATTR: AttrKey<String> = AttrKey::new("subject-token");

const CLIENT_CACHE_ATTR: AttrKey<Arc<ClientCache>> = AttrKey::new("tool-clients");

type ClientCache = DashMap<String, Arc<Client>>;

/// Registry entry mapping a published name to its owning server.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMapping {
    pub mcp_server: String,
    /// The tool's original name at its server.
    pub target_name: String,
    pub tool: Tool,
    /// Contributed by the caller at runtime rather than via config; calls
    /// surface back to the caller instead of dispatching downstream.
    pub external: bool,
}

/// Routes calls addressed to built-in servers. Implemented by the handler
/// tree and injected after construction.
#[async_trait]
pub trait BuiltinRouter: Send + Sync {
    async fn call_builtin(
        &self,
        session: &Arc<Session>,
        server: &str,
        tool: &str,
        arguments: Value,
        meta: Option<Value>,
    ) -> Result<CallToolResult, CoreError>;

    async fn list_builtin(&self, session: &Arc<Session>, server: &str)
        -> Result<Vec<Tool>, CoreError>;
}

/// Lazily connected catalogue of downstream ATP servers.
pub struct ToolRegistry {
    config: Arc<Config>,
    callbacks: Option<Arc<CallbackState>>,
    oauth_redirect_uri: String,
    max_concurrency: usize,
    sampler: Arc<RwLock<Option<Arc<dyn Sampler>>>>,
    builtins: RwLock<Option<Arc<dyn BuiltinRouter>>>,
    /// Servers whose listing already failed once this process; the failure
    /// is logged a single time and the registry stays usable.
    list_failures: DashMap<String, ()>,
    schema_warnings: DashMap<String, ()>,
}

impl ToolRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            callbacks: None,
            oauth_redirect_uri: String::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            sampler: Arc::new(RwLock::new(None)),
            builtins: RwLock::new(None),
            list_failures: DashMap::new(),
            schema_warnings: DashMap::new(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<CallbackState>, redirect_uri: String) -> Self {
        self.callbacks = Some(callbacks);
        self.oauth_redirect_uri = redirect_uri;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Setter injection; breaks the dependency cycle with the agent layer.
    pub fn set_sampler(&self, sampler: Arc<dyn Sampler>) {
        *self.sampler.write().expect("lock") = Some(sampler);
    }

    pub fn sampler(&self) -> Option<Arc<dyn Sampler>> {
        self.sampler.read().expect("lock").clone()
    }

    /// Wire in the built-in servers' router.
    pub fn set_builtins(&self, router: Arc<dyn BuiltinRouter>) {
        *self.builtins.write().expect("lock") = Some(router);
    }

    fn builtin_router(&self) -> Result<Arc<dyn BuiltinRouter>, CoreError> {
        self.builtins
            .read()
            .expect("lock")
            .clone()
            .ok_or_else(|| CoreError::internal("built-in servers not wired"))
    }

    /// The session's client for a declared server, connecting lazily and
    /// caching in the session attribute bag.
    pub async fn client_for(
        &self,
        session: &Arc<Session>,
        server: &str,
    ) -> Result<Arc<Client>, CoreError> {
        let cache = session.with_attrs(|attrs| match attrs.get(&CLIENT_CACHE_ATTR) {
            Some(cache) => cache,
            None => {
                let cache: Arc<ClientCache> = Arc::new(DashMap::new());
                attrs.set(&CLIENT_CACHE_ATTR, cache.clone());
                cache
            }
        });
        if let Some(client) = cache.get(server) {
            return Ok(client.clone());
        }

        let spec = self.config.mcp_servers.get(server).ok_or_else(|| {
            CoreError::invalid_params(format!("unknown mcp server {:?}", server))
        })?;
        let mut config = ClientConfig::new(spec.url.clone());
        config.headers = spec
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        config.oauth = ClientOAuth {
            client_id: spec.oauth.client_id.clone(),
            client_secret: spec.oauth.client_secret.clone(),
            token: spec.oauth.token.clone(),
            token_exchange_url: spec.oauth.token_exchange_url.clone(),
            redirect_uri: self.oauth_redirect_uri.clone(),
        };
        let client = Arc::new(
            Client::new(config, self.callbacks.clone()).map_err(CoreError::from)?,
        );
        if let Some(subject) = session.with_attrs(|attrs| attrs.get(&SUBJECT_TOKEN_ATTR)) {
            client.set_subject_token(subject);
        }
        self.attach_peer_handler(session, &client);

        let entry = cache.entry(server.to_string()).or_insert(client);
        Ok(entry.value().clone())
    }

    /// Route server-initiated traffic from a downstream wire: sampling goes
    /// to the injected sampler, elicitation and notifications are relayed to
    /// the owning inbound session.
    fn attach_peer_handler(&self, session: &Arc<Session>, client: &Arc<Client>) {
        let weak_session = Arc::downgrade(session);
        let sampler_slot = self.sampler.clone();
        let wire = client.wire().clone();
        client.start(Arc::new(move |msg: Message| {
            let Some(session) = weak_session.upgrade() else {
                return;
            };
            let sampler_slot = sampler_slot.clone();
            let wire = wire.clone();
            tokio::spawn(async move {
                let id = msg.id.clone();
                let method = msg.method_name().to_string();
                let reply = |response: Message| async move {
                    if let Err(err) = wire.send(&response).await {
                        debug!(error = %err, "failed to answer server-initiated request");
                    }
                };
                match method.as_str() {
                    "sampling/createMessage" => {
                        let Some(id) = id else { return };
                        let sampler = sampler_slot.read().expect("lock").clone();
                        let response = match sampler {
                            Some(sampler) => match msg.parse_params() {
                                Ok(params) => {
                                    match sampler.create_message(&session, params).await {
                                        Ok(result) => Message::response(
                                            id,
                                            serde_json::to_value(result).unwrap_or(Value::Null),
                                        ),
                                        Err(err) => {
                                            Message::error_response(Some(id), err.to_rpc_error())
                                        }
                                    }
                                }
                                Err(err) => Message::error_response(Some(id), err.to_rpc_error()),
                            },
                            None => Message::error_response(
                                Some(id),
                                CoreError::internal("no sampler registered").to_rpc_error(),
                            ),
                        };
                        reply(response).await;
                    }
                    "elicitation/create" => {
                        let Some(id) = id else { return };
                        // Relay the form request to our own peer and echo the
                        // answer back downstream.
                        let relayed = Message::request(
                            session_scoped_id(&session),
                            "elicitation/create",
                            msg.params.clone().unwrap_or(Value::Null),
                        );
                        let response = match session.exchange(relayed).await {
                            Ok(answer) => match answer.error {
                                Some(error) => Message::error_response(Some(id), error),
                                None => {
                                    Message::response(id, answer.result.unwrap_or(Value::Null))
                                }
                            },
                            Err(err) => Message::error_response(Some(id), err.to_rpc_error()),
                        };
                        reply(response).await;
                    }
                    _ if msg.is_notification() => {
                        if let Err(err) = session.send(msg).await {
                            debug!(error = %err, "failed to relay notification");
                        }
                    }
                    other => {
                        if let Some(id) = id {
                            reply(Message::error_response(
                                Some(id),
                                CoreError::method_not_found(other).to_rpc_error(),
                            ))
                            .await;
                        }
                    }
                }
            });
        }));
    }

    /// List one server's tools with schema coercion applied.
    async fn list_server_tools(
        &self,
        session: &Arc<Session>,
        server: &str,
    ) -> Result<Vec<Tool>, CoreError> {
        if BUILTIN_SERVERS.contains(&server) {
            return self.builtin_router()?.list_builtin(session, server).await;
        }
        let client = self.client_for(session, server).await?;
        let value = client.exchange("tools/list", json!({})).await?;
        let listed: ListToolsResult = serde_json::from_value(value)?;
        Ok(listed
            .tools
            .into_iter()
            .map(|mut tool| {
                let (schema, coerced) = ensure_object_schema(&tool.input_schema);
                if coerced {
                    let key = format!("{}/{}", server, tool.name);
                    if self.schema_warnings.insert(key.clone(), ()).is_none() {
                        warn!(tool = %key, "tool published no usable schema, coerced to empty object");
                    }
                }
                tool.input_schema = schema;
                tool
            })
            .collect())
    }

    /// Fan out `tools/list` over the given servers, bounded by
    /// `max_concurrency`. A server that fails to list is omitted from this
    /// cycle; the failure is logged once and the registry stays usable.
    pub async fn list_tools(
        &self,
        session: &Arc<Session>,
        servers: &[String],
    ) -> Vec<(String, ToolMapping)> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let lists = join_all(servers.iter().map(|server| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                (server.clone(), self.list_server_tools(session, server).await)
            }
        }))
        .await;

        let mut out = Vec::new();
        for (server, listed) in lists {
            match listed {
                Ok(tools) => out.extend(namespace_tools(&server, tools, false)),
                Err(err) => {
                    if self.list_failures.insert(server.clone(), ()).is_none() {
                        warn!(server = %server, error = %err, "server failed to list tools, omitting");
                    } else {
                        debug!(server = %server, error = %err, "server still failing to list tools");
                    }
                }
            }
        }
        out
    }

    /// Resolve configured references into the turn's tool surface.
    /// Unresolvable references are an error, unlike listing failures.
    pub async fn build_tool_mappings(
        &self,
        session: &Arc<Session>,
        refs: &[String],
    ) -> Result<Vec<(String, ToolMapping)>, CoreError> {
        let mut out: Vec<(String, ToolMapping)> = Vec::new();
        for raw in refs {
            let reference = crate::refs::ToolRef::parse(raw)?;

            // Agent references become pseudo-tools on the agent-as-tool
            // server.
            if self.config.agents.contains_key(&reference.server) && reference.tool.is_none() {
                let agent = &self.config.agents[&reference.server];
                let name = reference
                    .alias
                    .clone()
                    .unwrap_or_else(|| reference.server.clone());
                out.push((
                    name,
                    ToolMapping {
                        mcp_server: "agents".to_string(),
                        target_name: reference.server.clone(),
                        tool: agent_pseudo_tool(&reference.server, agent),
                        external: false,
                    },
                ));
                continue;
            }

            let is_builtin = BUILTIN_SERVERS.contains(&reference.server.as_str());
            if !is_builtin && !self.config.mcp_servers.contains_key(&reference.server) {
                return Err(CoreError::invalid_params(format!(
                    "tool reference {:?} names no configured server or agent",
                    raw
                )));
            }
            let tools = self.list_server_tools(session, &reference.server).await?;
            match &reference.tool {
                Some(wanted) => {
                    let tool = tools
                        .into_iter()
                        .find(|t| &t.name == wanted)
                        .ok_or_else(|| {
                            CoreError::invalid_params(format!(
                                "server {:?} publishes no tool {:?}",
                                reference.server, wanted
                            ))
                        })?;
                    let name = reference
                        .alias
                        .clone()
                        .unwrap_or_else(|| format!("{}_{}", reference.server, tool.name));
                    out.push((
                        name,
                        ToolMapping {
                            mcp_server: reference.server.clone(),
                            target_name: wanted.clone(),
                            tool,
                            external: false,
                        },
                    ));
                }
                None => {
                    let mut entries = namespace_tools(&reference.server, tools, false);
                    if entries.len() == 1 {
                        if let Some(alias) = reference.alias.clone() {
                            entries[0].0 = alias;
                        }
                    }
                    out.extend(entries);
                }
            }
        }
        Ok(out)
    }

    /// Dispatch one tool call to its owning server.
    ///
    /// The session's hook pipeline intercepts the materialised `tools/call`
    /// in both directions; a request-side rejection means nothing is sent
    /// downstream.
    pub async fn call(
        &self,
        session: &Arc<Session>,
        server: &str,
        tool: &str,
        arguments: Value,
        async_call: bool,
        progress_token: Option<Value>,
    ) -> Result<CallToolResult, CoreError> {
        let mut meta = Map::new();
        if async_call {
            meta.insert("ai.nanobot.async".to_string(), Value::Bool(true));
        }
        if let Some(token) = progress_token {
            meta.insert("progressToken".to_string(), token);
        }
        let mut params = json!({"name": tool, "arguments": arguments});
        if !meta.is_empty() {
            params["_meta"] = Value::Object(meta);
        }

        let request = Message::request(session_scoped_id(session), "tools/call", params);
        let (hooks, tags) = session.hook_context();
        let request = hooks.run(Direction::Request, request, &tags).await?;
        let params = request.params.clone().unwrap_or(Value::Null);
        let call_args = params
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Null);
        let call_meta = params.get("_meta").cloned();

        let result = if BUILTIN_SERVERS.contains(&server) {
            self.builtin_router()?
                .call_builtin(session, server, tool, call_args, call_meta)
                .await?
        } else {
            let client = self.client_for(session, server).await?;
            let value = client.exchange("tools/call", params).await?;
            parse_call_result(value)?
        };

        let response = Message::response(
            request.id.clone().expect("request id"),
            serde_json::to_value(&result)?,
        );
        let response = hooks.run(Direction::Response, response, &tags).await?;
        if let Some(error) = response.error {
            return Err(CoreError::from_rpc_error(error));
        }
        parse_call_result(response.result.unwrap_or(Value::Null))
    }
}

fn session_scoped_id(session: &Arc<Session>) -> nanobot_types::RequestId {
    nanobot_types::RequestId::Str(format!("{}-{}", session.id(), uuid::Uuid::new_v4()))
}

/// Tolerant decode: anything that is not a structured tool result is wrapped
/// as one text item.
fn parse_call_result(value: Value) -> Result<CallToolResult, CoreError> {
    if value.is_object() && (value.get("content").is_some() || value.get("isError").is_some()) {
        return Ok(serde_json::from_value(value)?);
    }
    Ok(CallToolResult::text(value.to_string()))
}

/// Apply the namespacing rule: `<server>_<tool>`, or the bare server name
/// when the server publishes exactly one tool.
fn namespace_tools(server: &str, tools: Vec<Tool>, external: bool) -> Vec<(String, ToolMapping)> {
    let single = tools.len() == 1;
    tools
        .into_iter()
        .map(|tool| {
            let name = if single {
                server.to_string()
            } else {
                format!("{}_{}", server, tool.name)
            };
            (
                name,
                ToolMapping {
                    mcp_server: server.to_string(),
                    target_name: tool.name.clone(),
                    tool,
                    external,
                },
            )
        })
        .collect()
}

/// Mappings keyed by published name, for per-call lookup.
pub fn mappings_by_name(
    mappings: &[(String, ToolMapping)],
) -> BTreeMap<String, ToolMapping> {
    mappings
        .iter()
        .map(|(name, mapping)| (name.clone(), mapping.clone()))
        .collect()
}

fn agent_pseudo_tool(name: &str, agent: &nanobot_config::Agent) -> Tool {
    let description = match &agent.instructions {
        nanobot_config::Instructions::Text(text) if !text.is_empty() => {
            format!("Invoke the {} agent.", name)
                + " "
                + text.lines().next().unwrap_or_default()
        }
        _ => format!("Invoke the {} agent.", name),
    };
    Tool {
        name: name.to_string(),
        description: Some(description),
        input_schema: json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string"}
            },
            "required": ["prompt"],
            "additionalProperties": false
        }),
        ..Default::default()
    }
}
