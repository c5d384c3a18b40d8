//! The duplex ATP channel: POST out, SSE in, correlated by id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use nanobot_types::{CoreError, Message, SESSION_ID_HEADER};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::WireError;
use crate::oauth::{self, parse_www_authenticate, TokenExchangeConfig};
use crate::pending::PendingRequests;
use crate::sse::{parse_body, SseParser};

/// Invoked for every inbound message that is not a response to one of our
/// requests: server-initiated requests and notifications.
pub type MessageHandlerFn = Arc<dyn Fn(Message) + Send + Sync>;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// One duplex channel to one ATP peer.
///
/// A Wire never invents a session id: it records the id the peer assigns and
/// presents it on every subsequent request until closed. Reconnects resume
/// the event stream from the last seen event id.
pub struct Wire {
    http: reqwest::Client,
    base_url: Url,
    /// POST target; legacy SSE mode swaps this to the endpoint-event URL.
    post_url: RwLock<Url>,
    headers: Vec<(String, String)>,
    session_id: RwLock<Option<String>>,
    bearer: RwLock<Option<String>>,
    subject_token: RwLock<Option<String>>,
    token_exchange: Option<TokenExchangeConfig>,
    pending: PendingRequests,
    handler: RwLock<Option<MessageHandlerFn>>,
    cancel: CancellationToken,
    need_reconnect: AtomicBool,
    sse_running: AtomicBool,
    last_event_id: RwLock<Option<String>>,
    legacy_mode: AtomicBool,
    legacy_notify: tokio::sync::Notify,
    initialized: AtomicBool,
}

impl Wire {
    pub fn new(
        base_url: &str,
        headers: Vec<(String, String)>,
        token_exchange: Option<TokenExchangeConfig>,
    ) -> Result<Self, WireError> {
        let base_url = Url::parse(base_url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            post_url: RwLock::new(base_url.clone()),
            base_url,
            headers,
            session_id: RwLock::new(None),
            bearer: RwLock::new(None),
            subject_token: RwLock::new(None),
            token_exchange,
            pending: PendingRequests::new(),
            handler: RwLock::new(None),
            cancel: CancellationToken::new(),
            need_reconnect: AtomicBool::new(false),
            sse_running: AtomicBool::new(false),
            last_event_id: RwLock::new(None),
            legacy_mode: AtomicBool::new(false),
            legacy_notify: tokio::sync::Notify::new(),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().expect("lock").clone()
    }

    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.write().expect("lock") = Some(id.into());
    }

    pub fn clear_session_id(&self) {
        *self.session_id.write().expect("lock") = None;
        self.initialized.store(false, Ordering::SeqCst);
    }

    pub fn set_bearer(&self, token: impl Into<String>) {
        *self.bearer.write().expect("lock") = Some(token.into());
    }

    /// The inbound caller's credential, exchanged per RFC 8693 before each
    /// send when a token-exchange endpoint is configured.
    pub fn set_subject_token(&self, token: impl Into<String>) {
        *self.subject_token.write().expect("lock") = Some(token.into());
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.read().expect("lock").clone()
    }

    /// Point POSTs somewhere other than the base endpoint, as a resumed
    /// legacy-mode session requires.
    pub fn set_endpoint_override(&self, endpoint: &str) -> Result<(), WireError> {
        let url = self.base_url.join(endpoint)?;
        *self.post_url.write().expect("lock") = url;
        self.legacy_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The current POST target, relative to the base URL when overridden.
    pub fn endpoint_override(&self) -> Option<String> {
        if self.legacy_mode.load(Ordering::SeqCst) {
            Some(self.post_url.read().expect("lock").to_string())
        } else {
            None
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Install the inbound handler. Responses never reach it; they resolve
    /// through the pending table.
    pub fn start(&self, handler: MessageHandlerFn) {
        *self.handler.write().expect("lock") = Some(handler);
    }

    /// Allocate a request id unique on this wire.
    pub fn allocate_id(&self) -> nanobot_types::RequestId {
        self.pending.allocate()
    }

    fn effective_bearer(&self) -> Option<String> {
        self.bearer.read().expect("lock").clone()
    }

    async fn outbound_bearer(&self) -> Option<String> {
        let original = self.effective_bearer();
        let (Some(exchange), Some(subject)) = (
            self.token_exchange.as_ref(),
            self.subject_token.read().expect("lock").clone(),
        ) else {
            return original;
        };
        match oauth::token_exchange(&self.http, exchange, &subject, self.base_url.as_str()).await {
            Ok(Some(token)) => Some(token),
            Ok(None) => original,
            Err(err) => {
                debug!(error = %err, "token exchange failed, keeping original bearer");
                original
            }
        }
    }

    /// POST one message to the peer.
    ///
    /// `Ok(None)` means the peer accepted a notification (202) or will
    /// deliver the response over the event stream. `Ok(Some)` carries the
    /// in-band response, whether it arrived as JSON or as an SSE-framed body.
    pub async fn send(&self, msg: &Message) -> Result<Option<Message>, WireError> {
        if self.cancel.is_cancelled() {
            return Err(WireError::Closed);
        }
        let target = self.post_url.read().expect("lock").clone();
        let mut req = self
            .http
            .post(target)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(msg);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(id) = self.session_id() {
            req = req.header(SESSION_ID_HEADER, id);
        }
        if let Some(bearer) = self.outbound_bearer().await {
            req = req.bearer_auth(bearer);
        }

        let resp = req.send().await?;
        let status = resp.status();

        if let Some(id) = resp
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session_id(id);
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let resource = parse_www_authenticate(challenge).unwrap_or_default();
            return Err(CoreError::AuthRequired {
                protected_resource: resource,
            }
            .into());
        }
        if status == reqwest::StatusCode::NOT_FOUND && self.initialized.load(Ordering::SeqCst) {
            return Err(CoreError::SessionNotFound {
                session_id: self.session_id().unwrap_or_default(),
            }
            .into());
        }
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WireError::transport(format!(
                "{} {}: {}",
                status,
                msg.method_name(),
                if body.is_empty() { "no body" } else { &body }
            )));
        }

        let is_sse = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);
        let body = resp.text().await?;
        if body.is_empty() {
            return Ok(None);
        }
        if is_sse {
            for event in parse_body(&body) {
                if !event.is_message() || event.data.is_empty() {
                    continue;
                }
                let inner: Message = serde_json::from_str(&event.data)
                    .map_err(|e| WireError::transport(format!("sse body frame: {}", e)))?;
                if inner.is_response() {
                    return Ok(Some(inner));
                }
                self.dispatch_inbound(inner);
            }
            return Err(WireError::transport("event-stream body held no response"));
        }
        let parsed: Message = serde_json::from_str(&body)
            .map_err(|e| WireError::transport(format!("response body: {}", e)))?;
        Ok(Some(parsed))
    }

    /// Send a request and await its response, allocating an id if the caller
    /// set none.
    pub async fn request(&self, mut msg: Message) -> Result<Message, WireError> {
        if msg.id.is_none() {
            msg.id = Some(self.pending.allocate());
        }
        let id = msg.id.clone().expect("id just set");
        let rx = self.pending.register(msg.clone())?;

        match self.send(&msg).await {
            Ok(Some(response)) => {
                self.pending.forget(&id);
                Ok(response)
            }
            Ok(None) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.pending.forget(&id);
                        Err(WireError::Core(CoreError::Cancelled))
                    }
                    received = rx => received.map_err(|_| WireError::Closed),
                }
            }
            Err(err) => {
                self.pending.forget(&id);
                Err(err)
            }
        }
    }

    fn dispatch_inbound(&self, msg: Message) {
        if msg.is_response() && self.pending.resolve(msg.clone()) {
            return;
        }
        let handler = self.handler.read().expect("lock").clone();
        match handler {
            Some(handler) => handler(msg),
            None => debug!(method = msg.method_name(), "inbound message with no handler"),
        }
    }

    /// Idempotently open the server-to-client event stream.
    ///
    /// Returns once the stream is established; a background task keeps
    /// reading and reconnects with `Last-Event-ID` after read errors, for as
    /// long as the wire's context lives.
    pub async fn ensure_sse(wire: &Arc<Wire>) -> Result<(), WireError> {
        // The reader task owns reconnection for its whole life, so a live
        // task means there is nothing to do even mid-reconnect.
        if wire.sse_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let resp = match wire.connect_sse().await {
            Ok(resp) => resp,
            Err(err) => {
                wire.sse_running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        wire.need_reconnect.store(false, Ordering::SeqCst);

        let wire = Arc::clone(wire);
        tokio::spawn(async move {
            wire.read_stream(resp).await;
            loop {
                if wire.cancel.is_cancelled() {
                    break;
                }
                wire.need_reconnect.store(true, Ordering::SeqCst);
                tokio::select! {
                    _ = wire.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
                match wire.connect_sse().await {
                    Ok(resp) => {
                        wire.need_reconnect.store(false, Ordering::SeqCst);
                        // Ids of requests still in flight are regenerated so
                        // late responses to the old ids cannot be mistaken
                        // for answers to the re-sent copies.
                        for request in wire.pending.regenerate_ids() {
                            match wire.send(&request).await {
                                Ok(Some(response)) => wire.dispatch_inbound(response),
                                Ok(None) => {}
                                Err(err) => {
                                    warn!(error = %err, "re-sending request after reconnect failed")
                                }
                            }
                        }
                        wire.read_stream(resp).await;
                    }
                    Err(err) => {
                        debug!(error = %err, "sse reconnect attempt failed");
                    }
                }
            }
            wire.sse_running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn connect_sse(&self) -> Result<reqwest::Response, WireError> {
        let mut req = self
            .http
            .get(self.base_url.clone())
            .header("Accept", "text/event-stream");
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(id) = self.session_id() {
            req = req.header(SESSION_ID_HEADER, id);
        }
        if let Some(bearer) = self.effective_bearer() {
            req = req.bearer_auth(bearer);
        }
        if let Some(last) = self.last_event_id() {
            req = req.header("Last-Event-ID", last);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(WireError::transport(format!(
                "sse connect: HTTP {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    async fn read_stream(&self, resp: reqwest::Response) {
        let mut parser = SseParser::new();
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    debug!(error = %err, "sse read error");
                    return;
                }
                None => return,
            };
            let text = String::from_utf8_lossy(&bytes);
            for event in parser.push(&text) {
                if let Some(id) = &event.id {
                    *self.last_event_id.write().expect("lock") = Some(id.clone());
                }
                if event.event == "endpoint" {
                    // Legacy SSE mode: subsequent POSTs go to the announced
                    // endpoint URL.
                    match self.base_url.join(event.data.trim()) {
                        Ok(endpoint) => {
                            *self.post_url.write().expect("lock") = endpoint;
                            self.legacy_mode.store(true, Ordering::SeqCst);
                            self.legacy_notify.notify_waiters();
                        }
                        Err(err) => warn!(error = %err, "bad endpoint event url"),
                    }
                    continue;
                }
                if event.is_message() && !event.data.is_empty() {
                    match serde_json::from_str::<Message>(&event.data) {
                        Ok(msg) => self.dispatch_inbound(msg),
                        Err(err) => warn!(error = %err, "undecodable sse frame"),
                    }
                }
            }
        }
    }

    /// True once the peer announced a legacy `endpoint` event, waiting up to
    /// `timeout` for one to arrive.
    pub async fn wait_legacy_endpoint(&self, timeout: Duration) -> bool {
        if self.legacy_mode.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = self.legacy_notify.notified() => true,
            _ = tokio::time::sleep(timeout) => self.legacy_mode.load(Ordering::SeqCst),
        }
    }

    /// Tear down the wire. With `delete`, a best-effort DELETE ends the
    /// session at the peer first.
    pub async fn close(&self, delete: bool) {
        if delete {
            if let Some(id) = self.session_id() {
                let mut req = self.http.delete(self.base_url.clone()).header(SESSION_ID_HEADER, id);
                if let Some(bearer) = self.effective_bearer() {
                    req = req.bearer_auth(bearer);
                }
                if let Err(err) = req.send().await {
                    debug!(error = %err, "session delete failed");
                }
            }
        }
        self.cancel.cancel();
        self.pending.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::json;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/atp", addr)
    }

    #[tokio::test]
    async fn test_send_parses_json_response() {
        let app = Router::new().route(
            "/atp",
            post(|| async {
                (
                    [("Mcp-Session-Id", "s-1")],
                    axum::Json(json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})),
                )
            }),
        );
        let url = serve(app).await;
        let wire = Wire::new(&url, vec![], None).unwrap();
        let resp = wire
            .send(&Message::request(1, "ping", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        assert_eq!(wire.session_id().as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_send_notification_accepts_202() {
        let app = Router::new().route("/atp", post(|| async { StatusCode::ACCEPTED }));
        let url = serve(app).await;
        let wire = Wire::new(&url, vec![], None).unwrap();
        let out = wire
            .send(&Message::notification("notifications/initialized", None))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_send_parses_sse_framed_response() {
        let app = Router::new().route(
            "/atp",
            post(|| async {
                (
                    [("content-type", "text/event-stream")],
                    "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"hi\"}\n\n",
                )
            }),
        );
        let url = serve(app).await;
        let wire = Wire::new(&url, vec![], None).unwrap();
        let resp = wire
            .send(&Message::request(1, "tools/call", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.result, Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_send_401_yields_auth_required() {
        let app = Router::new().route(
            "/atp",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    [(
                        "WWW-Authenticate",
                        r#"Bearer error="invalid_request", resource_metadata="https://rs/.well-known/oauth-protected-resource""#,
                    )],
                )
                    .into_response()
            }),
        );
        let url = serve(app).await;
        let wire = Wire::new(&url, vec![], None).unwrap();
        match wire.send(&Message::request(1, "initialize", json!({}))).await {
            Err(WireError::Core(CoreError::AuthRequired { protected_resource })) => {
                assert!(protected_resource.contains("oauth-protected-resource"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_404_after_init_is_session_not_found() {
        let app = Router::new().route("/atp", post(|| async { StatusCode::NOT_FOUND }));
        let url = serve(app).await;
        let wire = Wire::new(&url, vec![], None).unwrap();
        wire.set_session_id("gone");
        wire.mark_initialized();
        match wire.send(&Message::request(1, "tools/list", json!({}))).await {
            Err(WireError::Core(CoreError::SessionNotFound { session_id })) => {
                assert_eq!(session_id, "gone");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_carries_session_header() {
        let app = Router::new().route(
            "/atp",
            post(|headers: HeaderMap, axum::Json(msg): axum::Json<serde_json::Value>| async move {
                assert_eq!(headers.get("Mcp-Session-Id").unwrap(), "sess-9");
                axum::Json(json!({"jsonrpc": "2.0", "id": msg["id"], "result": null}))
            }),
        );
        let url = serve(app).await;
        let wire = Wire::new(&url, vec![], None).unwrap();
        wire.set_session_id("sess-9");
        let resp = wire.request(Message::request(5, "ping", json!({}))).await.unwrap();
        assert_eq!(resp.id, Some(nanobot_types::RequestId::Num(5)));
    }

    #[tokio::test]
    async fn test_sse_stream_delivers_server_messages() {
        let app = Router::new().route(
            "/atp",
            get(|| async {
                (
                    [("content-type", "text/event-stream")],
                    Body::from(
                        "id: 1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"progressToken\":\"t\",\"progress\":1.0}}\n\n",
                    ),
                )
            })
            .post(|| async { StatusCode::ACCEPTED }),
        );
        let url = serve(app).await;
        let wire = Arc::new(Wire::new(&url, vec![], None).unwrap());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        wire.start(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }));
        Wire::ensure_sse(&wire).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.method_name(), "notifications/progress");
        assert_eq!(wire.last_event_id().as_deref(), Some("1"));
        wire.close(false).await;
    }

    #[tokio::test]
    async fn test_legacy_endpoint_switches_post_target() {
        let app = Router::new()
            .route(
                "/atp",
                get(|| async {
                    (
                        [("content-type", "text/event-stream")],
                        Body::from("event: endpoint\ndata: /legacy/post\n\n"),
                    )
                }),
            )
            .route(
                "/legacy/post",
                post(|axum::Json(msg): axum::Json<serde_json::Value>| async move {
                    axum::Json(json!({"jsonrpc": "2.0", "id": msg["id"], "result": "legacy"}))
                }),
            );
        let url = serve(app).await;
        let wire = Arc::new(Wire::new(&url, vec![], None).unwrap());
        Wire::ensure_sse(&wire).await.unwrap();
        assert!(wire.wait_legacy_endpoint(Duration::from_secs(2)).await);
        let resp = wire
            .request(Message::request(1, "initialize", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.result, Some(json!("legacy")));
        wire.close(false).await;
    }
}
