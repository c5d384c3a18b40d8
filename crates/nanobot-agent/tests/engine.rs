//! Engine loop tests against a scripted completer and stub tool servers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use nanobot_agent::{
    AgentEngine, Completer, CompletionItem, CompletionOptions, CompletionRequest,
    CompletionResponse, ProgressSink,
};
use nanobot_config::Config;
use nanobot_session::{ProgressFloor, Session};
use nanobot_tools::ToolRegistry;
use nanobot_types::CoreError;
use serde_json::{json, Value};

struct ScriptedCompleter {
    responses: Mutex<VecDeque<CompletionResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompleter {
    fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn seen_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Completer for ScriptedCompleter {
    async fn complete(
        &self,
        request: &CompletionRequest,
        progress: &ProgressSink,
    ) -> Result<CompletionResponse, CoreError> {
        self.requests.lock().unwrap().push(request.clone());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CoreError::internal("completer script exhausted"))?;
        for item in &response.output {
            progress.emit(item.clone());
        }
        Ok(response)
    }
}

fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        output: vec![CompletionItem::assistant_text(text)],
        model: "stub-model".to_string(),
    }
}

fn tool_call_response(call_id: &str, name: &str, args: Value) -> CompletionResponse {
    CompletionResponse {
        output: vec![CompletionItem::ToolCall {
            id: format!("item-{}", call_id),
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments: args,
        }],
        model: "stub-model".to_string(),
    }
}

fn session() -> Arc<Session> {
    Arc::new(Session::new("sess-engine", Arc::new(ProgressFloor::new())))
}

fn request(agent: &str, prompt: &str) -> CompletionRequest {
    CompletionRequest {
        agent: agent.to_string(),
        input: vec![CompletionItem::user_text(prompt)],
        ..Default::default()
    }
}

async fn stub_search_server() -> String {
    let app = Router::new().route(
        "/atp",
        post(|axum::Json(msg): axum::Json<Value>| async move {
            match msg["method"].as_str() {
                Some("initialize") => (
                    [("Mcp-Session-Id", "s")],
                    axum::Json(json!({
                        "jsonrpc": "2.0",
                        "id": msg["id"],
                        "result": {
                            "protocolVersion": "2025-06-18",
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "search", "version": "0"}
                        }
                    })),
                )
                    .into_response(),
                Some("notifications/initialized") => {
                    axum::http::StatusCode::ACCEPTED.into_response()
                }
                Some("tools/list") => axum::Json(json!({
                    "jsonrpc": "2.0",
                    "id": msg["id"],
                    "result": {"tools": [
                        {"name": "search", "description": "Search.",
                         "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}}
                    ]}
                }))
                .into_response(),
                Some("tools/call") => axum::Json(json!({
                    "jsonrpc": "2.0",
                    "id": msg["id"],
                    "result": {"isError": false, "content": [{"type": "text", "text": "42"}]}
                }))
                .into_response(),
                _ => axum::http::StatusCode::BAD_REQUEST.into_response(),
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/atp", addr)
}

fn engine_with(config: Value, completer: Arc<ScriptedCompleter>) -> AgentEngine {
    let config: Arc<Config> = Arc::new(serde_json::from_value(config).unwrap());
    let registry = Arc::new(ToolRegistry::new(config.clone()));
    AgentEngine::new(config, registry, completer)
}

#[tokio::test]
async fn test_plain_turn_completes_without_tools() {
    let completer = ScriptedCompleter::new(vec![text_response("hi")]);
    let engine = engine_with(json!({"agents": {"main": {"model": "m"}}}), completer.clone());
    let session = session();

    let response = engine
        .run(&session, request("main", "hello"), CompletionOptions::default())
        .await
        .unwrap();

    assert_eq!(response.assistant_text(), "hi");
    let seen = completer.seen_requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].model, "m");
}

#[tokio::test]
async fn test_progress_items_stream_under_token() {
    let completer = ScriptedCompleter::new(vec![text_response("hi")]);
    let engine = engine_with(json!({"agents": {"main": {"model": "m"}}}), completer);
    let session = session();

    let opts = CompletionOptions {
        progress_token: Some(json!("tok-1")),
        ..Default::default()
    };
    engine
        .run(&session, request("main", "hello"), opts)
        .await
        .unwrap();

    let mut rx = session.take_mailbox().unwrap();
    let frame = rx.recv().await.unwrap();
    assert_eq!(frame.method_name(), "notifications/progress");
    let params = frame.params.unwrap();
    assert_eq!(params["progressToken"], "tok-1");
    let item = &params["_meta"]["ai.nanobot/progress"]["item"];
    assert_eq!(item["type"], "message");
    assert_eq!(item["content"][0]["text"], "hi");
}

#[tokio::test]
async fn test_tool_call_loop_dispatches_and_follows_up() {
    let url = stub_search_server().await;
    let completer = ScriptedCompleter::new(vec![
        tool_call_response("call-1", "search", json!({"query": "x"})),
        text_response("the answer is 42"),
    ]);
    let engine = engine_with(
        json!({
            "agents": {"main": {"model": "m", "tools": ["search"]}},
            "mcpServers": {"search": {"url": url}}
        }),
        completer.clone(),
    );
    let session = session();

    let response = engine
        .run(&session, request("main", "find x"), CompletionOptions::default())
        .await
        .unwrap();

    assert_eq!(response.assistant_text(), "the answer is 42");

    let seen = completer.seen_requests();
    assert_eq!(seen.len(), 2);
    // The follow-up request replays the tool result for the model.
    let followup = &seen[1];
    let has_result = followup.input.iter().any(|item| match item {
        CompletionItem::ToolResult { call_id, output } => {
            call_id == "call-1" && output.content[0].as_text() == Some("42")
        }
        _ => false,
    });
    assert!(has_result, "follow-up input missing tool result");
    // The tool surface reached the model with the namespaced-single name.
    assert_eq!(seen[0].tools.len(), 1);
    assert_eq!(seen[0].tools[0].name, "search");
}

#[tokio::test]
async fn test_ui_tool_action_skips_model_round_trip() {
    let url = stub_search_server().await;
    let completer = ScriptedCompleter::new(vec![text_response("done")]);
    let engine = engine_with(
        json!({
            "agents": {"main": {"model": "m", "tools": ["search"]}},
            "mcpServers": {"search": {"url": url}}
        }),
        completer.clone(),
    );
    let session = session();

    let action = json!({"type": "tool", "payload": {"toolName": "search", "args": {"query": "x"}}});
    let response = engine
        .run(
            &session,
            request("main", &action.to_string()),
            CompletionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.assistant_text(), "done");
    // Only the follow-up hit the completer; the tool call itself was
    // synthesized from the UI action.
    let seen = completer.seen_requests();
    assert_eq!(seen.len(), 1);
    let has_result = seen[0].input.iter().any(|item| {
        matches!(item, CompletionItem::ToolResult { output, .. }
            if output.content[0].as_text() == Some("42"))
    });
    assert!(has_result);
}

#[tokio::test]
async fn test_second_turn_replays_first() {
    let completer = ScriptedCompleter::new(vec![text_response("first"), text_response("second")]);
    let engine = engine_with(json!({"agents": {"main": {"model": "m"}}}), completer.clone());
    let session = session();

    engine
        .run(&session, request("main", "one"), CompletionOptions::default())
        .await
        .unwrap();
    engine
        .run(&session, request("main", "two"), CompletionOptions::default())
        .await
        .unwrap();

    let seen = completer.seen_requests();
    let second_input = &seen[1].input;
    let texts: Vec<String> = second_input
        .iter()
        .filter_map(|item| match item {
            CompletionItem::Message { content, .. } => {
                content.first().and_then(|c| c.as_text()).map(str::to_string)
            }
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["one", "first", "two"]);
}

#[tokio::test]
async fn test_new_thread_archives_history() {
    let completer = ScriptedCompleter::new(vec![text_response("first"), text_response("fresh")]);
    let engine = engine_with(json!({"agents": {"main": {"model": "m"}}}), completer.clone());
    let session = session();

    engine
        .run(&session, request("main", "one"), CompletionOptions::default())
        .await
        .unwrap();

    let mut fresh = request("main", "two");
    fresh.new_thread = true;
    engine
        .run(&session, fresh, CompletionOptions::default())
        .await
        .unwrap();

    let seen = completer.seen_requests();
    // The archived history is absent from the new thread's first request.
    let texts: Vec<String> = seen[1]
        .input
        .iter()
        .filter_map(|item| match item {
            CompletionItem::Message { content, .. } => {
                content.first().and_then(|c| c.as_text()).map(str::to_string)
            }
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["two"]);
}

#[tokio::test]
async fn test_failed_turn_restores_previous_execution() {
    let completer = ScriptedCompleter::new(vec![text_response("first")]);
    let engine = engine_with(json!({"agents": {"main": {"model": "m"}}}), completer.clone());
    let session = session();

    engine
        .run(&session, request("main", "one"), CompletionOptions::default())
        .await
        .unwrap();

    // Script exhausted: this turn fails.
    let err = engine
        .run(&session, request("main", "two"), CompletionOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exhausted"));

    // A later successful turn still sees the first turn's history only.
    let completer2 = ScriptedCompleter::new(vec![text_response("third")]);
    let engine2 = AgentEngine::new(
        engine_config(),
        Arc::new(ToolRegistry::new(engine_config())),
        completer2.clone(),
    );
    // Reuse the same session state through the shared attribute bag.
    engine2
        .run(&session, request("main", "three"), CompletionOptions::default())
        .await
        .unwrap();
    let seen = completer2.seen_requests();
    let texts: Vec<String> = seen[0]
        .input
        .iter()
        .filter_map(|item| match item {
            CompletionItem::Message { content, .. } => {
                content.first().and_then(|c| c.as_text()).map(str::to_string)
            }
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["one", "first", "three"]);
}

fn engine_config() -> Arc<Config> {
    Arc::new(serde_json::from_value(json!({"agents": {"main": {"model": "m"}}})).unwrap())
}

#[tokio::test]
async fn test_unknown_agent_rejected() {
    let completer = ScriptedCompleter::new(vec![]);
    let engine = engine_with(json!({"agents": {}}), completer);
    let err = engine
        .run(&session(), request("ghost", "x"), CompletionOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
