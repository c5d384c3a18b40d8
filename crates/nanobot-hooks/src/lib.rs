//! Tag-matched interception of ATP messages through external endpoints.
//!
//! Every outbound request and inbound response passes the pipeline. A hook
//! whose tags match is POSTed the message and may rewrite it, wave it
//! through, or reject it. Rejection terminates the pipeline and surfaces as
//! a `HookRejected` error on the calling path, which means a rejected
//! `tools/call` never reaches the wire.

use nanobot_config::HookConfig;
use nanobot_types::{CoreError, Message};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Direction of the message under interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    /// The synthetic tag this direction matches.
    pub fn tag(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// Body POSTed to a hook endpoint.
#[derive(Debug, Serialize)]
struct HookCall<'a> {
    accept: bool,
    message: &'a Message,
    reason: &'a str,
}

/// Decision returned by a hook endpoint.
#[derive(Debug, Deserialize)]
struct HookDecision {
    accept: bool,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    reason: String,
}

/// Does this binding match the message in this direction?
///
/// Tags are method names, the synthetic `request`/`response` tags, or labels
/// carried in `extra_tags` (from agent or server configs).
pub fn matches(hook: &HookConfig, direction: Direction, method: &str, extra_tags: &[String]) -> bool {
    hook.on.iter().any(|tag| {
        tag == direction.tag() || (!method.is_empty() && tag == method) || extra_tags.contains(tag)
    })
}

/// The hook pipeline over one config's bindings.
///
/// Bindings run in registration order. Errors invoking a hook do not abort
/// the pipeline by themselves; they are collected and joined into the error
/// only when the final decision is a rejection.
pub struct HookPipeline {
    hooks: Vec<HookConfig>,
    http: reqwest::Client,
}

impl HookPipeline {
    pub fn new(hooks: Vec<HookConfig>) -> Self {
        Self {
            hooks,
            http: reqwest::Client::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every matching hook over `msg`. Returns the possibly rewritten
    /// message, or `HookRejected` when any hook refuses it.
    pub async fn run(
        &self,
        direction: Direction,
        msg: Message,
        extra_tags: &[String],
    ) -> Result<Message, CoreError> {
        let mut current = msg;
        let mut invoke_errors: Vec<String> = Vec::new();
        let method = current.method_name().to_string();

        for hook in &self.hooks {
            if !matches(hook, direction, &method, extra_tags) {
                continue;
            }
            if current.error.is_some() && !hook.call_on_error {
                continue;
            }
            let decision = match self.invoke(hook, direction, &current, &method).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(hook = %hook.name, error = %err, "hook invocation failed");
                    invoke_errors.push(format!("{}: {}", hook.name, err));
                    continue;
                }
            };
            if !decision.accept {
                let mut reason = decision.reason;
                if !invoke_errors.is_empty() {
                    reason = format!("{} (hook errors: {})", reason, invoke_errors.join("; "));
                }
                return Err(CoreError::HookRejected {
                    hook: hook.name.clone(),
                    reason,
                });
            }
            if let Some(rewritten) = decision.message {
                debug!(hook = %hook.name, "hook rewrote message");
                current = rewritten;
            }
        }
        Ok(current)
    }

    async fn invoke(
        &self,
        hook: &HookConfig,
        direction: Direction,
        msg: &Message,
        method: &str,
    ) -> Result<HookDecision, CoreError> {
        let mut req = self
            .http
            .post(&hook.url)
            .query(&[
                ("name", hook.name.as_str()),
                ("direction", direction.tag()),
                ("callOnError", if hook.call_on_error { "true" } else { "false" }),
                ("method", method),
            ])
            .json(&HookCall {
                accept: true,
                message: msg,
                reason: "",
            });
        for (name, value) in &hook.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::Transport(format!(
                "hook {} answered HTTP {}",
                hook.name,
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| CoreError::Transport(format!("hook {} body: {}", hook.name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn hook(name: &str, on: &[&str], url: &str) -> HookConfig {
        HookConfig {
            name: name.into(),
            on: on.iter().map(|s| s.to_string()).collect(),
            url: url.into(),
            headers: Default::default(),
            call_on_error: false,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    #[test]
    fn test_matching_by_method_and_synthetic_tags() {
        let h = hook("h", &["tools/call"], "http://x");
        assert!(matches(&h, Direction::Request, "tools/call", &[]));
        assert!(!matches(&h, Direction::Request, "tools/list", &[]));

        let h = hook("h", &["request"], "http://x");
        assert!(matches(&h, Direction::Request, "anything", &[]));
        assert!(!matches(&h, Direction::Response, "anything", &[]));

        let h = hook("h", &["audit-label"], "http://x");
        assert!(matches(&h, Direction::Response, "", &["audit-label".into()]));
        assert!(!matches(&h, Direction::Response, "", &[]));
    }

    #[tokio::test]
    async fn test_accepting_hook_passes_message_through() {
        let app = Router::new().route(
            "/hook",
            post(|Json(_): Json<Value>| async { Json(json!({"accept": true, "reason": ""})) }),
        );
        let url = serve(app).await;
        let pipeline = HookPipeline::new(vec![hook("ok", &["request"], &url)]);
        let msg = Message::request(1, "tools/call", json!({"name": "chat"}));
        let out = pipeline.run(Direction::Request, msg.clone(), &[]).await.unwrap();
        assert_eq!(out, msg);
    }

    #[tokio::test]
    async fn test_rejecting_hook_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let app = Router::new().route(
            "/hook",
            post(move |Json(_): Json<Value>| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"accept": false, "reason": "denied"}))
                }
            }),
        );
        let url = serve(app).await;
        let pipeline = HookPipeline::new(vec![
            hook("guard", &["tools/call"], &url),
            hook("never-reached", &["tools/call"], &url),
        ]);
        let msg = Message::request(1, "tools/call", json!({"name": "chat"}));
        match pipeline.run(Direction::Request, msg, &[]).await {
            Err(CoreError::HookRejected { hook, reason }) => {
                assert_eq!(hook, "guard");
                assert_eq!(reason, "denied");
            }
            other => panic!("unexpected: {:?}", other),
        }
        // Pipeline stopped at the first rejection.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rewriting_hook_replaces_message() {
        let app = Router::new().route(
            "/hook",
            post(|Json(body): Json<Value>| async move {
                let mut msg = body["message"].clone();
                msg["params"]["arguments"]["injected"] = json!(true);
                Json(json!({"accept": true, "message": msg, "reason": ""}))
            }),
        );
        let url = serve(app).await;
        let pipeline = HookPipeline::new(vec![hook("rewrite", &["tools/call"], &url)]);
        let msg = Message::request(1, "tools/call", json!({"name": "chat", "arguments": {}}));
        let out = pipeline.run(Direction::Request, msg, &[]).await.unwrap();
        assert_eq!(out.params.unwrap()["arguments"]["injected"], true);
    }

    #[tokio::test]
    async fn test_unreachable_hook_does_not_abort_by_itself() {
        let pipeline = HookPipeline::new(vec![hook(
            "gone",
            &["request"],
            "http://127.0.0.1:1/nope",
        )]);
        let msg = Message::request(1, "ping", json!({}));
        let out = pipeline.run(Direction::Request, msg.clone(), &[]).await.unwrap();
        assert_eq!(out, msg);
    }

    #[tokio::test]
    async fn test_invoke_errors_joined_into_rejection() {
        let app = Router::new().route(
            "/hook",
            post(|| async { Json(json!({"accept": false, "reason": "no"})) }),
        );
        let url = serve(app).await;
        let pipeline = HookPipeline::new(vec![
            hook("gone", &["request"], "http://127.0.0.1:1/nope"),
            hook("guard", &["request"], &url),
        ]);
        let msg = Message::request(1, "ping", json!({}));
        match pipeline.run(Direction::Request, msg, &[]).await {
            Err(CoreError::HookRejected { reason, .. }) => {
                assert!(reason.starts_with("no"));
                assert!(reason.contains("gone"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hook_receives_direction_params() {
        let app = Router::new().route(
            "/hook",
            post(
                |Query(params): Query<HashMap<String, String>>, Json(_): Json<Value>| async move {
                    assert_eq!(params["direction"], "response");
                    assert_eq!(params["name"], "h");
                    Json(json!({"accept": true, "reason": ""}))
                },
            ),
        );
        let url = serve(app).await;
        let pipeline = HookPipeline::new(vec![hook("h", &["response"], &url)]);
        let msg = Message::response(nanobot_types::RequestId::Num(1), json!("ok"));
        pipeline.run(Direction::Response, msg, &[]).await.unwrap();
    }
}
