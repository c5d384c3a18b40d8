//! The per-peer session object.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use nanobot_hooks::{Direction, HookPipeline};
use nanobot_types::{CoreError, InitializeRequest, InitializeResult, Message};
use nanobot_wire::PendingRequests;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attrs::AttrBag;
use crate::progress::ProgressFloor;

/// Outbound message filter: rewrite, pass, or drop (`None`).
pub type FilterFn = Arc<dyn Fn(Message) -> Result<Option<Message>, CoreError> + Send + Sync>;

/// Per-session dispatcher for inbound requests and notifications.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound request or notification. `Ok(Some(value))` becomes
    /// the response result; `Ok(None)` acknowledges a notification.
    async fn handle(&self, session: &Arc<Session>, msg: &Message) -> Result<Option<Value>, CoreError>;
}

/// The state a session round-trips through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialize_request: Option<InitializeRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialize_result: Option<InitializeResult>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Process-resident per-peer state.
///
/// Ephemeral parts (pending table, mailbox, attribute slots without a
/// serializer) are rebuilt when the store reloads a session; only the
/// initialize pair and the persistable attribute subset survive.
pub struct Session {
    id: String,
    parent: Option<String>,
    account: RwLock<String>,
    init: RwLock<Option<(InitializeRequest, InitializeResult)>>,
    attrs: Mutex<AttrBag>,
    env: Mutex<BTreeMap<String, String>>,
    parent_env: BTreeMap<String, String>,
    filters: Mutex<Vec<FilterFn>>,
    hooks: RwLock<Arc<HookPipeline>>,
    hook_tags: Mutex<Vec<String>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    pending: PendingRequests,
    mailbox_tx: mpsc::UnboundedSender<Message>,
    mailbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    progress: Arc<ProgressFloor>,
    cancel: CancellationToken,
    dirty: AtomicBool,
}

impl Session {
    pub fn new(id: impl Into<String>, progress: Arc<ProgressFloor>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            parent: None,
            account: RwLock::new("local".to_string()),
            init: RwLock::new(None),
            attrs: Mutex::new(AttrBag::new()),
            env: Mutex::new(BTreeMap::new()),
            parent_env: BTreeMap::new(),
            filters: Mutex::new(Vec::new()),
            hooks: RwLock::new(Arc::new(HookPipeline::new(Vec::new()))),
            hook_tags: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
            pending: PendingRequests::new(),
            mailbox_tx: tx,
            mailbox_rx: Mutex::new(Some(rx)),
            progress,
            cancel: CancellationToken::new(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Rebuild a session from its persisted state. Everything ephemeral
    /// starts fresh.
    pub fn from_persisted(state: PersistedSession, progress: Arc<ProgressFloor>) -> Self {
        let mut session = Self::new(state.id, progress);
        session.parent = state.parent;
        if let (Some(req), Some(result)) = (state.initialize_request, state.initialize_result) {
            *session.init.get_mut().expect("fresh lock") = Some((req, result));
        }
        session
            .attrs
            .get_mut()
            .expect("fresh lock")
            .load_persisted(state.attributes);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn set_parent(&mut self, parent: impl Into<String>) {
        self.parent = Some(parent.into());
    }

    pub fn account(&self) -> String {
        self.account.read().expect("lock").clone()
    }

    pub fn set_account(&self, account: impl Into<String>) {
        *self.account.write().expect("lock") = account.into();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress_floor(&self) -> &Arc<ProgressFloor> {
        &self.progress
    }

    /// The negotiated initialize pair; immutable once set.
    pub fn initialize_pair(&self) -> Option<(InitializeRequest, InitializeResult)> {
        self.init.read().expect("lock").clone()
    }

    pub fn set_initialize(&self, request: InitializeRequest, result: InitializeResult) {
        let mut guard = self.init.write().expect("lock");
        if guard.is_some() {
            warn!(session = %self.id, "initialize pair already negotiated, ignoring");
            return;
        }
        *guard = Some((request, result));
        self.mark_dirty();
    }

    /// Run `f` over the attribute bag under the session lock.
    pub fn with_attrs<R>(&self, f: impl FnOnce(&mut AttrBag) -> R) -> R {
        let mut bag = self.attrs.lock().expect("lock");
        let result = f(&mut bag);
        self.dirty.store(true, Ordering::Relaxed);
        result
    }

    /// Own env overlaid on the parent env.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        let mut merged = self.parent_env.clone();
        merged.extend(self.env.lock().expect("lock").clone());
        merged
    }

    /// Copy-on-write env mutation: only the own map changes.
    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.env.lock().expect("lock").insert(key.into(), value.into());
        self.mark_dirty();
    }

    pub fn set_parent_env(&mut self, env: BTreeMap<String, String>) {
        self.parent_env = env;
    }

    pub fn add_filter(&self, filter: FilterFn) {
        self.filters.lock().expect("lock").push(filter);
    }

    pub fn set_hooks(&self, hooks: Arc<HookPipeline>) {
        *self.hooks.write().expect("lock") = hooks;
    }

    pub fn add_hook_tag(&self, tag: impl Into<String>) {
        self.hook_tags.lock().expect("lock").push(tag.into());
    }

    pub fn attach_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.write().expect("lock") = Some(handler);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }

    fn hooks_and_tags(&self) -> (Arc<HookPipeline>, Vec<String>) {
        (
            self.hooks.read().expect("lock").clone(),
            self.hook_tags.lock().expect("lock").clone(),
        )
    }

    /// The hook pipeline and tag set in force, for callers that intercept
    /// traffic on this session's behalf (the registry's downstream calls).
    pub fn hook_context(&self) -> (Arc<HookPipeline>, Vec<String>) {
        self.hooks_and_tags()
    }

    /// Dispatch one inbound message.
    ///
    /// Responses resolve the pending table. Requests run the hook pipeline
    /// on the way in, the handler, and the hook pipeline again on the way
    /// out. A hook rejection becomes an error-shaped response without the
    /// handler ever running. `AuthRequired` is lifted to the caller
    /// unchanged so the HTTP layer can emit its 401 challenge.
    pub async fn dispatch(
        session: &Arc<Session>,
        msg: Message,
    ) -> Result<Option<Message>, CoreError> {
        if msg.is_response() {
            if !session.pending.resolve(msg) {
                debug!(session = %session.id, "response for unknown request id");
            }
            return Ok(None);
        }

        let id = msg.id.clone();
        let (hooks, tags) = session.hooks_and_tags();
        let msg = match hooks.run(Direction::Request, msg, &tags).await {
            Ok(msg) => msg,
            Err(err @ CoreError::HookRejected { .. }) => {
                return Ok(id.map(|id| Message::error_response(Some(id), err.to_rpc_error())));
            }
            Err(err) => return Err(err),
        };

        let handler = session
            .handler
            .read()
            .expect("lock")
            .clone()
            .ok_or_else(|| CoreError::internal("session has no handler attached"))?;

        let response = match handler.handle(session, &msg).await {
            Ok(Some(result)) => match id {
                Some(id) => Message::response(id, result),
                None => return Ok(None),
            },
            Ok(None) => return Ok(None),
            Err(err @ CoreError::AuthRequired { .. }) => return Err(err),
            Err(err) => match id {
                Some(id) => Message::error_response(Some(id), err.to_rpc_error()),
                None => {
                    warn!(session = %session.id, error = %err, "notification handler failed");
                    return Ok(None);
                }
            },
        };
        session.mark_dirty();

        let response_id = response.id.clone();
        let response = match hooks.run(Direction::Response, response, &tags).await {
            Ok(response) => response,
            Err(err @ CoreError::HookRejected { .. }) => {
                Message::error_response(response_id, err.to_rpc_error())
            }
            Err(err) => return Err(err),
        };
        Ok(Some(response))
    }

    /// Process an outbound message: progress normalisation, request-direction
    /// hooks, then filters. `Ok(None)` means a filter dropped it.
    async fn outbound(&self, msg: Message) -> Result<Option<Message>, CoreError> {
        let msg = self.normalize_progress(msg);
        let (hooks, tags) = self.hooks_and_tags();
        let mut msg = hooks.run(Direction::Request, msg, &tags).await?;
        let filters = self.filters.lock().expect("lock").clone();
        for filter in filters {
            match filter(msg)? {
                Some(next) => msg = next,
                None => return Ok(None),
            }
        }
        Ok(Some(msg))
    }

    /// Rewrite `params.progress` so each token's sequence is strictly
    /// increasing. Progress bars never regress.
    fn normalize_progress(&self, mut msg: Message) -> Message {
        if msg.method_name() != "notifications/progress" {
            return msg;
        }
        let Some(params) = msg.params.as_mut().and_then(Value::as_object_mut) else {
            return msg;
        };
        let (Some(token), Some(progress)) = (
            params.get("progressToken").cloned(),
            params.get("progress").and_then(Value::as_f64),
        ) else {
            return msg;
        };
        let total = params.get("total").and_then(Value::as_f64);
        let normalized = self.progress.normalize(&self.id, &token, progress, total);
        params.insert("progress".to_string(), Value::from(normalized));
        msg
    }

    /// Queue a notification for the peer's event stream.
    pub async fn send(&self, msg: Message) -> Result<(), CoreError> {
        match self.outbound(msg).await? {
            Some(msg) => self
                .mailbox_tx
                .send(msg)
                .map_err(|_| CoreError::Cancelled),
            None => Ok(()),
        }
    }

    /// Convenience wrapper building a notification from method and params.
    pub async fn send_payload(&self, method: &str, params: Value) -> Result<(), CoreError> {
        self.send(Message::notification(method, Some(params))).await
    }

    /// Server-initiated request over the event stream; awaits the response
    /// the peer POSTs back.
    pub async fn exchange(&self, mut msg: Message) -> Result<Message, CoreError> {
        if msg.id.is_none() {
            msg.id = Some(self.pending.allocate());
        }
        let prepared = self
            .outbound(msg)
            .await?
            .ok_or_else(|| CoreError::internal("request dropped by filter"))?;
        let id = prepared
            .id
            .clone()
            .ok_or_else(|| CoreError::internal("request id stripped in flight"))?;
        let rx = self
            .pending
            .register(prepared.clone())
            .map_err(CoreError::from)?;
        if self.mailbox_tx.send(prepared).is_err() {
            self.pending.forget(&id);
            return Err(CoreError::Cancelled);
        }
        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.forget(&id);
                return Err(CoreError::Cancelled);
            }
            received = rx => received.map_err(|_| CoreError::Cancelled)?,
        };
        let (hooks, tags) = self.hooks_and_tags();
        hooks.run(Direction::Response, response, &tags).await
    }

    /// Take the mailbox receiver for the single event-stream reader.
    /// A second taker gets `None` until the first returns it.
    pub fn take_mailbox(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.mailbox_rx.lock().expect("lock").take()
    }

    pub fn return_mailbox(&self, rx: mpsc::UnboundedReceiver<Message>) {
        *self.mailbox_rx.lock().expect("lock") = Some(rx);
    }

    /// Snapshot for the store.
    pub fn to_persisted(&self) -> PersistedSession {
        let (initialize_request, initialize_result) = match self.initialize_pair() {
            Some((req, result)) => (Some(req), Some(result)),
            None => (None, None),
        };
        PersistedSession {
            id: self.id.clone(),
            parent: self.parent.clone(),
            initialize_request,
            initialize_result,
            attributes: self.attrs.lock().expect("lock").persistable_json(),
        }
    }

    /// Cancel everything in flight; pending waiters observe cancellation.
    pub fn close(&self) {
        self.cancel.cancel();
        self.pending.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_types::RequestId;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(
            &self,
            _session: &Arc<Session>,
            msg: &Message,
        ) -> Result<Option<Value>, CoreError> {
            match msg.method_name() {
                "ping" => Ok(Some(json!({"pong": msg.params}))),
                "notifications/initialized" => Ok(None),
                "auth-needed" => Err(CoreError::AuthRequired {
                    protected_resource: "https://rs/meta".into(),
                }),
                other => Err(CoreError::method_not_found(other)),
            }
        }
    }

    fn session() -> Arc<Session> {
        let s = Arc::new(Session::new("sess-1", Arc::new(ProgressFloor::new())));
        s.attach_handler(Arc::new(EchoHandler));
        s
    }

    #[tokio::test]
    async fn test_dispatch_request_builds_response() {
        let s = session();
        let out = Session::dispatch(&s, Message::request(1, "ping", json!({"x": 1})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.id, Some(RequestId::Num(1)));
        assert_eq!(out.result.unwrap()["pong"]["x"], 1);
    }

    #[tokio::test]
    async fn test_dispatch_notification_yields_no_response() {
        let s = session();
        let out = Session::dispatch(
            &s,
            Message::notification("notifications/initialized", Some(json!({}))),
        )
        .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method_is_error_response() {
        let s = session();
        let out = Session::dispatch(&s, Message::request(2, "no/such", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.error.unwrap().code, nanobot_types::error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_auth_required_lifted_to_caller() {
        let s = session();
        match Session::dispatch(&s, Message::request(3, "auth-needed", json!({}))).await {
            Err(CoreError::AuthRequired { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_responses_to_pending() {
        let s = session();
        let exchange = {
            let s = s.clone();
            tokio::spawn(async move {
                s.exchange(Message::request(10, "sampling/createMessage", json!({})))
                    .await
            })
        };
        // Drain the outbound mailbox like the SSE stream would.
        let mut rx = s.take_mailbox().unwrap();
        let outbound = rx.recv().await.unwrap();
        assert_eq!(outbound.id, Some(RequestId::Num(10)));

        // Peer answers by POSTing the response back.
        Session::dispatch(
            &s,
            Message::response(RequestId::Num(10), json!({"role": "assistant"})),
        )
        .await
        .unwrap();
        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.result.unwrap()["role"], "assistant");
    }

    #[tokio::test]
    async fn test_filter_drops_outbound_message() {
        let s = session();
        s.add_filter(Arc::new(|msg: Message| {
            if msg.method_name() == "notifications/progress" {
                Ok(None)
            } else {
                Ok(Some(msg))
            }
        }));
        s.send_payload("notifications/progress", json!({"progressToken": "t", "progress": 1.0}))
            .await
            .unwrap();
        s.send_payload("notifications/message", json!({"level": "info"}))
            .await
            .unwrap();
        let mut rx = s.take_mailbox().unwrap();
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.method_name(), "notifications/message");
    }

    #[tokio::test]
    async fn test_outbound_progress_is_monotonic() {
        let s = session();
        for raw in [0.2, 0.1] {
            s.send_payload(
                "notifications/progress",
                json!({"progressToken": "t", "progress": raw, "total": 1.0}),
            )
            .await
            .unwrap();
        }
        let mut rx = s.take_mailbox().unwrap();
        let first = rx.recv().await.unwrap().params.unwrap()["progress"].as_f64().unwrap();
        let second = rx.recv().await.unwrap().params.unwrap()["progress"].as_f64().unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_env_overlay_copy_on_write() {
        let mut raw = Session::new("child", Arc::new(ProgressFloor::new()));
        raw.set_parent_env(BTreeMap::from([
            ("SHARED".to_string(), "parent".to_string()),
            ("ONLY_PARENT".to_string(), "yes".to_string()),
        ]));
        let s = Arc::new(raw);
        s.set_env("SHARED", "child");
        let env = s.env_map();
        assert_eq!(env["SHARED"], "child");
        assert_eq!(env["ONLY_PARENT"], "yes");
    }

    #[tokio::test]
    async fn test_mailbox_single_reader() {
        let s = session();
        let rx = s.take_mailbox().unwrap();
        assert!(s.take_mailbox().is_none());
        s.return_mailbox(rx);
        assert!(s.take_mailbox().is_some());
    }

    #[test]
    fn test_persisted_roundtrip_keeps_init_pair() {
        let s = session();
        s.set_initialize(
            InitializeRequest {
                protocol_version: "2025-06-18".into(),
                ..Default::default()
            },
            InitializeResult {
                protocol_version: "2025-06-18".into(),
                ..Default::default()
            },
        );
        let persisted = s.to_persisted();
        let reloaded = Session::from_persisted(persisted, Arc::new(ProgressFloor::new()));
        let (req, _result) = reloaded.initialize_pair().unwrap();
        assert_eq!(req.protocol_version, "2025-06-18");
    }

    #[test]
    fn test_initialize_pair_immutable_once_set() {
        let s = session();
        s.set_initialize(
            InitializeRequest {
                protocol_version: "v1".into(),
                ..Default::default()
            },
            InitializeResult::default(),
        );
        s.set_initialize(
            InitializeRequest {
                protocol_version: "v2".into(),
                ..Default::default()
            },
            InitializeResult::default(),
        );
        assert_eq!(s.initialize_pair().unwrap().0.protocol_version, "v1");
    }
}
