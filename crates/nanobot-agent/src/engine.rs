//! The turn loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use nanobot_config::{Agent, Config, Instructions};
use nanobot_hooks::Direction;
use nanobot_session::{AttrKey, Session};
use nanobot_types::{fix_schema, CallToolResult, Content, CoreError, GetPromptResult, Message};
use nanobot_tools::{ChatDriver, ChatRequest, ToolMapping, ToolRegistry};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::completer::{Completer, ProgressSink};
use crate::execution::Execution;
use crate::types::{
    CompletionItem, CompletionOptions, CompletionRequest, CompletionResponse, ToolCallOutput,
    ToolDef, ToolIncludeContext,
};
use crate::ui_action::{sniff_ui_action, UiAction};

/// Execution per thread name, persisted with the session.
const THREADS_ATTR: AttrKey<BTreeMap<String, Execution>> = AttrKey::new("agent-threads");
/// Archived executions, keyed `thread@timestamp`.
const ARCHIVE_ATTR: AttrKey<BTreeMap<String, Execution>> = AttrKey::new("agent-thread-archive");

const DEFAULT_THREAD: &str = "default";

/// The agent completion engine.
#[derive(Clone)]
pub struct AgentEngine {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) completer: Arc<dyn Completer>,
}

impl AgentEngine {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ToolRegistry>,
        completer: Arc<dyn Completer>,
    ) -> Self {
        Self {
            config,
            registry,
            completer,
        }
    }

    fn agent(&self, name: &str) -> Result<Agent, CoreError> {
        self.config
            .agents
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::invalid_params(format!("unknown agent {:?}", name)))
    }

    /// Drive one user turn to completion.
    ///
    /// On error the previously stored execution is restored, so the thread's
    /// visible history survives a failed turn.
    pub async fn run(
        &self,
        session: &Arc<Session>,
        request: CompletionRequest,
        opts: CompletionOptions,
    ) -> Result<CompletionResponse, CoreError> {
        let agent = self.agent(&request.agent)?;
        let thread = request
            .thread_name
            .clone()
            .or_else(|| agent.thread_name.clone())
            .unwrap_or_else(|| DEFAULT_THREAD.to_string());

        let mut threads = session
            .with_attrs(|attrs| attrs.restore(&THREADS_ATTR))
            .unwrap_or_default();
        let mut previous = threads.get(&thread).cloned();

        if request.new_thread {
            if let Some(old) = previous.take() {
                let key = format!("{}@{}", thread, Utc::now().to_rfc3339());
                let mut archive = session
                    .with_attrs(|attrs| attrs.restore(&ARCHIVE_ATTR))
                    .unwrap_or_default();
                archive.insert(key, old);
                session.with_attrs(|attrs| attrs.set_persistable(&ARCHIVE_ATTR, archive));
            }
        }
        let fallback = previous.clone();

        match self.run_loop(session, &agent, request, &opts, previous).await {
            Ok((execution, response)) => {
                threads.insert(thread, execution);
                session.with_attrs(|attrs| attrs.set_persistable(&THREADS_ATTR, threads));
                Ok(response)
            }
            Err(err) => {
                if let Some(saved) = fallback {
                    threads.insert(thread, saved);
                    session.with_attrs(|attrs| attrs.set_persistable(&THREADS_ATTR, threads));
                }
                Err(err)
            }
        }
    }

    async fn run_loop(
        &self,
        session: &Arc<Session>,
        agent: &Agent,
        request: CompletionRequest,
        opts: &CompletionOptions,
        previous: Option<Execution>,
    ) -> Result<(Execution, CompletionResponse), CoreError> {
        let mut execution = Execution::new(request);
        execution.previous = previous.map(Box::new);

        loop {
            if session.cancel_token().is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.populate(session, agent, &mut execution, opts).await?;

            if let Some(response) = self.run_before(session, agent, &mut execution).await? {
                execution.response = Some(response.clone());
                execution.done = true;
                return Ok((execution, response));
            }

            let synthesized = self.handle_ui_action(session, &mut execution).await?;
            let response = match synthesized {
                Some(response) => response,
                None => {
                    let populated = execution
                        .populated
                        .clone()
                        .expect("populated before complete");
                    let (sink, rx) = ProgressSink::new();
                    let forwarder =
                        spawn_progress_forwarder(session.clone(), opts.progress_token.clone(), rx);
                    let result = self.completer.complete(&populated, &sink).await;
                    drop(sink);
                    let _ = forwarder.await;
                    result?
                }
            };

            let response = self.run_after(session, agent, response).await?;
            execution.response = Some(response.clone());

            let calls: Vec<(String, String, Value)> = response
                .tool_calls()
                .into_iter()
                .map(|(call_id, name, args)| {
                    (call_id.to_string(), name.to_string(), args.clone())
                })
                .collect();

            if calls.is_empty() {
                execution.done = true;
                return Ok((execution, response));
            }

            self.dispatch_tool_calls(session, &mut execution, calls, opts)
                .await;

            if execution.has_pending_external() {
                // External tools answer asynchronously through the caller;
                // the turn parks here until they do.
                execution.done = false;
                return Ok((execution, response));
            }
            execution = execution.next_turn();
        }
    }

    /// Merge agent defaults, the previous execution's replayed transcript,
    /// fresh input, and the turn's tool surface.
    async fn populate(
        &self,
        session: &Arc<Session>,
        agent: &Agent,
        execution: &mut Execution,
        opts: &CompletionOptions,
    ) -> Result<(), CoreError> {
        let mut populated = execution.request.clone();

        if populated.model.is_empty() {
            populated.model = agent.model.clone();
        }
        if populated.system_prompt.is_none() {
            populated.system_prompt = self.resolve_instructions(session, agent).await?;
        }
        populated.temperature = populated.temperature.or(agent.temperature);
        populated.top_p = populated.top_p.or(agent.top_p);
        populated.max_tokens = populated.max_tokens.or(agent.max_tokens);
        populated.truncation = populated.truncation.or_else(|| agent.truncation.clone());
        if populated.tool_choice.is_none() {
            populated.tool_choice = agent.tool_choice.as_ref().map(|choice| match choice {
                nanobot_config::ToolChoice::Mode(mode) => mode.clone(),
                nanobot_config::ToolChoice::Named { name } => name.clone(),
            });
        }
        if populated.output_schema.is_none() {
            populated.output_schema = agent.output.as_ref().map(output_schema);
        }

        let mut input = Vec::new();
        if let Some(previous) = &execution.previous {
            input.extend(previous.replay());
        }
        input.extend(execution.request.input.iter().cloned());
        populated.input = input;

        let mut refs: Vec<String> = agent.tools.clone();
        refs.extend(agent.agents.iter().cloned());
        refs.extend(agent.mcp_servers.iter().cloned());
        let mappings = self.registry.build_tool_mappings(session, &refs).await?;

        let mut surface: Vec<(String, ToolMapping)> = match opts.tool_include {
            ToolIncludeContext::None => Vec::new(),
            ToolIncludeContext::ThisServer => mappings
                .into_iter()
                .filter(|(_, mapping)| Some(&mapping.mcp_server) == opts.tool_source.as_ref())
                .collect(),
            ToolIncludeContext::All => mappings,
        };
        for (name, mapping) in &opts.external_tools {
            let mut mapping = mapping.clone();
            mapping.external = true;
            surface.push((name.clone(), mapping));
        }

        populated.tools = surface
            .iter()
            .map(|(name, mapping)| ToolDef {
                name: name.clone(),
                description: mapping.tool.description.clone(),
                input_schema: fix_schema(&mapping.tool.input_schema, false),
            })
            .collect();
        execution.tool_to_server = surface.into_iter().collect();
        execution.populated = Some(populated);
        Ok(())
    }

    async fn resolve_instructions(
        &self,
        session: &Arc<Session>,
        agent: &Agent,
    ) -> Result<Option<String>, CoreError> {
        match &agent.instructions {
            Instructions::Text(text) if text.is_empty() => Ok(None),
            Instructions::Text(text) => Ok(Some(text.clone())),
            Instructions::PromptRef {
                mcp_server,
                prompt,
                args,
            } => {
                if mcp_server.is_empty() {
                    let local = self.config.prompts.get(prompt).ok_or_else(|| {
                        CoreError::invalid_params(format!("unknown prompt {:?}", prompt))
                    })?;
                    return Ok(Some(local.render(args)));
                }
                let client = self.registry.client_for(session, mcp_server).await?;
                let value = client
                    .exchange("prompts/get", json!({"name": prompt, "arguments": args}))
                    .await?;
                let result: GetPromptResult = serde_json::from_value(value)?;
                Ok(Some(prompt_text(&result)))
            }
        }
    }

    /// Interpret a UI action embedded in the last user text.
    ///
    /// A `tool` action short-circuits the model entirely: the synthesized
    /// response carries exactly one tool call. A `prompt` action rewrites
    /// the input and falls through to the completer.
    async fn handle_ui_action(
        &self,
        _session: &Arc<Session>,
        execution: &mut Execution,
    ) -> Result<Option<CompletionResponse>, CoreError> {
        let populated = execution.populated.as_mut().expect("populated");
        let action = match populated.input.last() {
            Some(CompletionItem::Message { role, content, .. })
                if role == "user" && content.len() == 1 =>
            {
                content[0].as_text().and_then(sniff_ui_action)
            }
            _ => None,
        };
        let Some(action) = action else {
            return Ok(None);
        };

        match action {
            UiAction::Tool { tool_name, args } => {
                debug!(tool = %tool_name, "ui action synthesises tool call");
                Ok(Some(CompletionResponse {
                    output: vec![CompletionItem::ToolCall {
                        id: uuid::Uuid::new_v4().to_string(),
                        call_id: format!("ui-{}", uuid::Uuid::new_v4()),
                        name: tool_name,
                        arguments: args,
                    }],
                    model: String::new(),
                }))
            }
            UiAction::PromptRef { prompt_name, args } => {
                let prompt = self.config.prompts.get(&prompt_name).ok_or_else(|| {
                    CoreError::invalid_params(format!("unknown prompt {:?}", prompt_name))
                })?;
                let rendered = prompt.render(&args);
                *populated.input.last_mut().expect("non-empty input") =
                    CompletionItem::user_text(rendered);
                Ok(None)
            }
            UiAction::PromptInline { prompt } => {
                *populated.input.last_mut().expect("non-empty input") =
                    CompletionItem::user_text(prompt);
                Ok(None)
            }
        }
    }

    /// Request-direction hook gate over the populated request. A hook that
    /// answers with a response ends the turn with it.
    async fn run_before(
        &self,
        session: &Arc<Session>,
        agent: &Agent,
        execution: &mut Execution,
    ) -> Result<Option<CompletionResponse>, CoreError> {
        let (hooks, mut tags) = session.hook_context();
        if hooks.is_empty() {
            return Ok(None);
        }
        tags.extend(agent.hooks.iter().cloned());
        let populated = execution.populated.clone().expect("populated");
        let msg = Message::request(
            uuid::Uuid::new_v4().to_string().as_str(),
            "completion/complete",
            serde_json::to_value(&populated)?,
        );
        let out = hooks.run(Direction::Request, msg, &tags).await?;
        if out.is_response() {
            let response: CompletionResponse =
                serde_json::from_value(out.result.unwrap_or(Value::Null))?;
            return Ok(Some(response));
        }
        if let Some(params) = out.params {
            execution.populated = Some(serde_json::from_value(params)?);
        }
        Ok(None)
    }

    /// Response-direction hook gate; hooks may rewrite the model output.
    async fn run_after(
        &self,
        session: &Arc<Session>,
        agent: &Agent,
        response: CompletionResponse,
    ) -> Result<CompletionResponse, CoreError> {
        let (hooks, mut tags) = session.hook_context();
        if hooks.is_empty() {
            return Ok(response);
        }
        tags.extend(agent.hooks.iter().cloned());
        let msg = Message::response(
            nanobot_types::RequestId::Str(uuid::Uuid::new_v4().to_string()),
            serde_json::to_value(&response)?,
        );
        let out = hooks.run(Direction::Response, msg, &tags).await?;
        Ok(serde_json::from_value(out.result.unwrap_or(Value::Null))?)
    }

    /// Dispatch the turn's tool calls concurrently, bounded by the
    /// registry's limit. Failures become `isError` results for the model;
    /// external tools are recorded as pending.
    async fn dispatch_tool_calls(
        &self,
        session: &Arc<Session>,
        execution: &mut Execution,
        calls: Vec<(String, String, Value)>,
        opts: &CompletionOptions,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.registry.max_concurrency()));
        let outcomes = join_all(calls.into_iter().map(|(call_id, name, args)| {
            let semaphore = semaphore.clone();
            let mapping = execution.tool_to_server.get(&name).cloned();
            let session = session.clone();
            let registry = self.registry.clone();
            let token = opts.progress_token.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                let Some(mapping) = mapping else {
                    return (
                        call_id,
                        Some(CallToolResult::error(format!("unknown tool {:?}", name))),
                    );
                };
                if mapping.external {
                    // Surface to the caller; they reply asynchronously.
                    return (call_id, None);
                }
                let output = match registry
                    .call(
                        &session,
                        &mapping.mcp_server,
                        &mapping.target_name,
                        args,
                        false,
                        token.clone(),
                    )
                    .await
                {
                    Ok(output) => output,
                    Err(err) => {
                        warn!(tool = %name, error = %err, "tool dispatch failed");
                        CallToolResult::error(err.to_string())
                    }
                };
                if let Some(token) = token {
                    emit_item_progress(
                        &session,
                        &token,
                        &CompletionItem::ToolResult {
                            call_id: call_id.clone(),
                            output: output.clone(),
                        },
                    )
                    .await;
                }
                (call_id, Some(output))
            }
        }))
        .await;

        for (call_id, outcome) in outcomes {
            match outcome {
                Some(output) => {
                    execution
                        .tool_outputs
                        .insert(call_id, ToolCallOutput { done: true, output });
                }
                None => {
                    execution.tool_outputs.insert(
                        call_id,
                        ToolCallOutput {
                            done: false,
                            output: CallToolResult::default(),
                        },
                    );
                }
            }
        }
    }

    /// Record the reply to an external pending call; the caller then re-runs
    /// the turn with empty input to resume the loop.
    pub fn provide_external_output(
        &self,
        session: &Arc<Session>,
        thread: &str,
        call_id: &str,
        output: CallToolResult,
    ) -> Result<(), CoreError> {
        let mut threads = session
            .with_attrs(|attrs| attrs.restore(&THREADS_ATTR))
            .unwrap_or_default();
        let execution = threads.get_mut(thread).ok_or_else(|| {
            CoreError::invalid_params(format!("unknown thread {:?}", thread))
        })?;
        let slot = execution.tool_outputs.get_mut(call_id).ok_or_else(|| {
            CoreError::invalid_params(format!("no pending call {:?}", call_id))
        })?;
        slot.output = output;
        slot.done = true;
        session.with_attrs(|attrs| attrs.set_persistable(&THREADS_ATTR, threads));
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatDriver for AgentEngine {
    async fn chat(
        &self,
        session: &Arc<Session>,
        request: ChatRequest,
    ) -> Result<CallToolResult, CoreError> {
        let mut content = vec![Content::text(request.prompt)];
        for attachment in &request.attachments {
            match attachment.get("uri").and_then(Value::as_str) {
                Some(uri) => content.push(Content::ResourceLink {
                    uri: uri.to_string(),
                    name: attachment
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    mime_type: attachment
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }),
                None => content.push(Content::text(attachment.to_string())),
            }
        }
        let completion = CompletionRequest {
            agent: request.agent,
            input: vec![CompletionItem::Message {
                id: uuid::Uuid::new_v4().to_string(),
                role: "user".to_string(),
                content,
            }],
            ..Default::default()
        };
        let opts = CompletionOptions {
            progress_token: request.progress_token.clone(),
            chat: true,
            ..Default::default()
        };

        if request.async_call {
            let engine = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run(&session, completion, opts).await {
                    warn!(error = %err, "async chat turn failed");
                }
            });
            return Ok(CallToolResult {
                is_error: false,
                content: vec![Content::text("accepted")],
                structured_content: Some(json!({"async": true})),
            });
        }

        let response = self.run(session, completion, opts).await?;
        let content: Vec<Content> = response
            .output
            .iter()
            .filter_map(|item| match item {
                CompletionItem::Message { role, content, .. } if role == "assistant" => {
                    Some(content.clone())
                }
                _ => None,
            })
            .flatten()
            .collect();
        Ok(CallToolResult {
            is_error: false,
            content: if content.is_empty() {
                vec![Content::text(String::new())]
            } else {
                content
            },
            structured_content: None,
        })
    }
}

fn output_schema(output: &nanobot_config::AgentOutput) -> Value {
    if let Some(schema) = &output.schema {
        return fix_schema(schema, output.strict);
    }
    let mut properties = serde_json::Map::new();
    for field in &output.fields {
        properties.insert(field.clone(), json!({"type": "string"}));
    }
    fix_schema(
        &json!({"type": "object", "properties": properties, "required": output.fields}),
        output.strict,
    )
}

fn prompt_text(result: &GetPromptResult) -> String {
    result
        .messages
        .iter()
        .filter_map(|m| m.content.as_text())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Forward partial items as `notifications/progress` frames.
fn spawn_progress_forwarder(
    session: Arc<Session>,
    token: Option<Value>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<CompletionItem>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if let Some(token) = &token {
                emit_item_progress(&session, token, &item).await;
            }
        }
    })
}

async fn emit_item_progress(session: &Arc<Session>, token: &Value, item: &CompletionItem) {
    let message_id = item
        .item_id()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let payload = json!({
        "progressToken": token,
        "progress": 1.0,
        "_meta": {
            "ai.nanobot/progress": {
                "messageId": message_id,
                "role": "assistant",
                "item": item,
            }
        }
    });
    if let Err(err) = session.send_payload("notifications/progress", payload).await {
        debug!(error = %err, "progress emission failed");
    }
}
