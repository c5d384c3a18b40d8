//! Outbound ATP client: a Wire plus the initialize and OAuth state machines.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use nanobot_types::{CoreError, Implementation, InitializeRequest, InitializeResult, Message};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::callback::{CallbackState, OAuthCoordinates};
use crate::error::WireError;
use crate::oauth::{
    authorize_url, client_credentials_token, discover_auth_server, exchange_code, pkce_pair,
    AuthServerMetadata, TokenExchangeConfig, TokenResponse,
};
use crate::state::SessionState;
use crate::wire::{MessageHandlerFn, Wire};

const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";
const LEGACY_ENDPOINT_WAIT: Duration = Duration::from_secs(5);
const INTERACTIVE_WAIT: Duration = Duration::from_secs(300);

/// OAuth coordinates for one peer.
#[derive(Debug, Clone, Default)]
pub struct ClientOAuth {
    pub client_id: String,
    pub client_secret: String,
    /// Static bearer; skips discovery entirely.
    pub token: Option<String>,
    /// RFC 8693 endpoint used to swap the inbound caller's credential for
    /// one this peer accepts.
    pub token_exchange_url: Option<String>,
    /// Where the authorization server redirects the browser.
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub headers: Vec<(String, String)>,
    pub client_info: Implementation,
    pub protocol_version: String,
    pub oauth: ClientOAuth,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            headers: Vec::new(),
            client_info: Implementation {
                name: "nanobot".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            oauth: ClientOAuth::default(),
        }
    }
}

/// An outbound peer connection with lazy initialization.
pub struct Client {
    wire: Arc<Wire>,
    http: reqwest::Client,
    config: ClientConfig,
    callbacks: Option<Arc<CallbackState>>,
    init_lock: tokio::sync::Mutex<()>,
    init_result: RwLock<Option<InitializeResult>>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        callbacks: Option<Arc<CallbackState>>,
    ) -> Result<Self, WireError> {
        let exchange = config
            .oauth
            .token_exchange_url
            .as_ref()
            .map(|endpoint| TokenExchangeConfig {
                endpoint: endpoint.clone(),
                client_id: config.oauth.client_id.clone(),
                client_secret: config.oauth.client_secret.clone(),
            });
        let wire = Arc::new(Wire::new(&config.base_url, config.headers.clone(), exchange)?);
        if let Some(token) = &config.oauth.token {
            wire.set_bearer(token.clone());
        }
        Ok(Self {
            wire,
            http: reqwest::Client::new(),
            config,
            callbacks,
            init_lock: tokio::sync::Mutex::new(()),
            init_result: RwLock::new(None),
        })
    }

    /// Reattach to a live peer session: no initialize, straight to the event
    /// stream so pushed notifications flow again.
    pub async fn resume(
        config: ClientConfig,
        callbacks: Option<Arc<CallbackState>>,
        state: SessionState,
    ) -> Result<Self, WireError> {
        let client = Self::new(config, callbacks)?;
        client.wire.set_session_id(state.session_id);
        if let Some(endpoint) = &state.endpoint_override {
            client.wire.set_endpoint_override(endpoint)?;
        }
        client.wire.mark_initialized();
        *client.init_result.write().expect("lock") = Some(state.initialize_result);
        Wire::ensure_sse(&client.wire).await?;
        Ok(client)
    }

    /// Install the handler for server-initiated traffic.
    pub fn start(&self, handler: MessageHandlerFn) {
        self.wire.start(handler);
    }

    pub fn wire(&self) -> &Arc<Wire> {
        &self.wire
    }

    /// Negotiated capabilities, once initialized.
    pub fn capabilities(&self) -> Option<InitializeResult> {
        self.init_result.read().expect("lock").clone()
    }

    pub fn session_state(&self) -> Option<SessionState> {
        Some(SessionState {
            session_id: self.wire.session_id()?,
            initialize_result: self.capabilities()?,
            endpoint_override: self.wire.endpoint_override(),
        })
    }

    /// Forward the inbound caller's credential for token exchange.
    pub fn set_subject_token(&self, token: impl Into<String>) {
        self.wire.set_subject_token(token);
    }

    fn initialize_request(&self) -> Message {
        let params = InitializeRequest {
            protocol_version: self.config.protocol_version.clone(),
            capabilities: Default::default(),
            client_info: self.config.client_info.clone(),
            meta: None,
        };
        Message::request(
            format!("init-{}", uuid::Uuid::new_v4()).as_str(),
            "initialize",
            serde_json::to_value(params).unwrap_or(Value::Null),
        )
    }

    /// Initialize lazily: first caller drives the handshake, everyone else
    /// waits on the same lock.
    pub async fn ensure_initialized(&self) -> Result<InitializeResult, WireError> {
        if let Some(result) = self.capabilities() {
            return Ok(result);
        }
        let _guard = self.init_lock.lock().await;
        if let Some(result) = self.capabilities() {
            return Ok(result);
        }

        let response = match self.wire.request(self.initialize_request()).await {
            Ok(response) => response,
            Err(WireError::Core(CoreError::AuthRequired { protected_resource })) => {
                self.obtain_token(&protected_resource).await?;
                self.wire.request(self.initialize_request()).await?
            }
            Err(first) => {
                // Legacy SSE mode: some peers only speak the endpoint-event
                // dialect. Open the stream and re-send to the announced URL.
                Wire::ensure_sse(&self.wire).await.map_err(|sse_err| {
                    WireError::transport(format!("initialize: {}; sse fallback: {}", first, sse_err))
                })?;
                if !self.wire.wait_legacy_endpoint(LEGACY_ENDPOINT_WAIT).await {
                    return Err(first);
                }
                self.wire.request(self.initialize_request()).await?
            }
        };

        if let Some(error) = response.error {
            return Err(WireError::Core(CoreError::from_rpc_error(error)));
        }
        let result: InitializeResult =
            serde_json::from_value(response.result.unwrap_or(Value::Null))
                .map_err(|e| WireError::transport(format!("initialize result: {}", e)))?;

        self.wire.mark_initialized();
        *self.init_result.write().expect("lock") = Some(result.clone());
        self.wire
            .send(&Message::notification("notifications/initialized", Some(json!({}))))
            .await?;
        Ok(result)
    }

    /// Run the OAuth machinery behind a 401: static token, interactive
    /// callback flow, or client-credentials grant, in that order.
    async fn obtain_token(&self, protected_resource: &str) -> Result<(), WireError> {
        if let Some(token) = &self.config.oauth.token {
            self.wire.set_bearer(token.clone());
            return Ok(());
        }
        // Without credentials there is no flow to run; the challenge goes
        // back to the caller untouched.
        if protected_resource.is_empty() || self.config.oauth.client_id.is_empty() {
            return Err(CoreError::AuthRequired {
                protected_resource: protected_resource.to_string(),
            }
            .into());
        }
        let meta = discover_auth_server(&self.http, protected_resource).await?;

        let token = if self.callbacks.is_some() {
            self.interactive_token(&meta).await?
        } else if !self.config.oauth.client_secret.is_empty() {
            client_credentials_token(
                &self.http,
                &meta.token_endpoint,
                &self.config.oauth.client_id,
                &self.config.oauth.client_secret,
            )
            .await?
        } else {
            return Err(CoreError::AuthRequired {
                protected_resource: protected_resource.to_string(),
            }
            .into());
        };
        self.wire.set_bearer(token.access_token);
        Ok(())
    }

    async fn interactive_token(
        &self,
        meta: &AuthServerMetadata,
    ) -> Result<TokenResponse, WireError> {
        let callbacks = self
            .callbacks
            .as_ref()
            .ok_or_else(|| WireError::transport("no callback handler configured"))?;
        let (verifier, challenge) = pkce_pair();
        let coords = OAuthCoordinates {
            token_endpoint: meta.token_endpoint.clone(),
            client_id: self.config.oauth.client_id.clone(),
            client_secret: self.config.oauth.client_secret.clone(),
            redirect_uri: self.config.oauth.redirect_uri.clone(),
        };
        let (state, rx) = callbacks.new_state(coords, None, verifier.clone());
        let url = authorize_url(
            &meta.authorization_endpoint,
            &self.config.oauth.client_id,
            &self.config.oauth.redirect_uri,
            &state,
            &challenge,
            &self.config.base_url,
        )?;
        info!(%url, "authorization required, complete the flow in a browser");

        let cancel_token = self.wire.cancel_token();
        let result = tokio::select! {
            _ = cancel_token.cancelled() => return Err(CoreError::Cancelled.into()),
            _ = tokio::time::sleep(INTERACTIVE_WAIT) => {
                return Err(WireError::transport("interactive authorization timed out"));
            }
            received = rx => received.map_err(|_| WireError::Closed)?,
        };
        if let Some(error) = result.error {
            return Err(WireError::transport(format!(
                "authorization failed: {} {}",
                error,
                result.error_description.unwrap_or_default()
            )));
        }
        let code = result
            .code
            .ok_or_else(|| WireError::transport("callback carried neither code nor error"))?;
        exchange_code(
            &self.http,
            &meta.token_endpoint,
            &self.config.oauth.client_id,
            &self.config.oauth.client_secret,
            &code,
            &self.config.oauth.redirect_uri,
            &verifier,
        )
        .await
    }

    /// One request/response exchange, initializing first when needed.
    ///
    /// A `SessionNotFound` answer drops the cached session and retries once
    /// after re-initializing; no other transport error is retried.
    pub async fn exchange(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        self.ensure_initialized().await.map_err(CoreError::from)?;
        match self.exchange_once(method, params.clone()).await {
            Err(CoreError::SessionNotFound { session_id }) => {
                debug!(session_id, "peer dropped our session, re-initializing");
                self.wire.clear_session_id();
                *self.init_result.write().expect("lock") = None;
                self.ensure_initialized().await.map_err(CoreError::from)?;
                self.exchange_once(method, params).await
            }
            other => other,
        }
    }

    async fn exchange_once(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        let id = self.wire.allocate_id();
        let response = self
            .wire
            .request(Message::request(id, method, params))
            .await
            .map_err(CoreError::from)?;
        if let Some(error) = response.error {
            return Err(CoreError::from_rpc_error(error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Fire a notification; initialization is still required first.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), CoreError> {
        self.ensure_initialized().await.map_err(CoreError::from)?;
        self.wire
            .send(&Message::notification(method, params))
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    /// Open the event stream so server-initiated messages can arrive.
    pub async fn ensure_sse(&self) -> Result<(), WireError> {
        Wire::ensure_sse(&self.wire).await
    }

    pub async fn close(&self, delete: bool) {
        if self.wire.session_id().is_none() && delete {
            warn!("close(delete) on a client that never initialized");
        }
        self.wire.close(delete).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/atp", addr)
    }

    fn init_result_body(id: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "stub", "version": "0"},
                "instructions": ""
            }
        })
    }

    fn stub_server() -> Router {
        Router::new().route(
            "/atp",
            post(|axum::Json(msg): axum::Json<Value>| async move {
                match msg["method"].as_str() {
                    Some("initialize") => (
                        [("Mcp-Session-Id", "sess-1")],
                        axum::Json(init_result_body(&msg["id"])),
                    )
                        .into_response(),
                    Some("notifications/initialized") => StatusCode::ACCEPTED.into_response(),
                    Some(_) => axum::Json(json!({
                        "jsonrpc": "2.0",
                        "id": msg["id"],
                        "result": {"echo": msg["params"]}
                    }))
                    .into_response(),
                    None => StatusCode::BAD_REQUEST.into_response(),
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_lazy_initialize_then_exchange() {
        let url = serve(stub_server()).await;
        let client = Client::new(ClientConfig::new(url), None).unwrap();

        let result = client.exchange("tools/list", json!({})).await.unwrap();
        assert_eq!(result["echo"], json!({}));
        assert_eq!(client.wire().session_id().as_deref(), Some("sess-1"));
        let caps = client.capabilities().unwrap();
        assert_eq!(caps.server_info.name, "stub");
    }

    #[tokio::test]
    async fn test_initialize_happens_once() {
        static INIT_COUNT: AtomicUsize = AtomicUsize::new(0);
        let app = Router::new().route(
            "/atp",
            post(|axum::Json(msg): axum::Json<Value>| async move {
                match msg["method"].as_str() {
                    Some("initialize") => {
                        INIT_COUNT.fetch_add(1, Ordering::SeqCst);
                        (
                            [("Mcp-Session-Id", "s")],
                            axum::Json(init_result_body(&msg["id"])),
                        )
                            .into_response()
                    }
                    Some("notifications/initialized") => StatusCode::ACCEPTED.into_response(),
                    _ => axum::Json(json!({"jsonrpc": "2.0", "id": msg["id"], "result": null}))
                        .into_response(),
                }
            }),
        );
        let url = serve(app).await;
        let client = Client::new(ClientConfig::new(url), None).unwrap();
        client.exchange("ping", json!({})).await.unwrap();
        client.exchange("ping", json!({})).await.unwrap();
        assert_eq!(INIT_COUNT.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_not_found_reinitializes_once() {
        // First session is discarded by the server after one call.
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let app = Router::new().route(
            "/atp",
            post(|headers: HeaderMap, axum::Json(msg): axum::Json<Value>| async move {
                match msg["method"].as_str() {
                    Some("initialize") => {
                        let n = CALLS.fetch_add(1, Ordering::SeqCst);
                        let sid = format!("sess-{}", n);
                        (
                            [("Mcp-Session-Id", sid)],
                            axum::Json(init_result_body(&msg["id"])),
                        )
                            .into_response()
                    }
                    Some("notifications/initialized") => StatusCode::ACCEPTED.into_response(),
                    _ => {
                        let sid = headers
                            .get("Mcp-Session-Id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("");
                        if sid == "sess-0" {
                            StatusCode::NOT_FOUND.into_response()
                        } else {
                            axum::Json(
                                json!({"jsonrpc": "2.0", "id": msg["id"], "result": "fresh"}),
                            )
                            .into_response()
                        }
                    }
                }
            }),
        );
        let url = serve(app).await;
        let client = Client::new(ClientConfig::new(url), None).unwrap();
        let out = client.exchange("tools/list", json!({})).await.unwrap();
        assert_eq!(out, json!("fresh"));
        assert_eq!(client.wire().session_id().as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_auth_required_without_credentials_surfaces() {
        let app = Router::new().route(
            "/atp",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    [(
                        "WWW-Authenticate",
                        r#"Bearer resource_metadata="https://rs/.well-known/oauth-protected-resource""#,
                    )],
                )
            }),
        );
        let url = serve(app).await;
        let client = Client::new(ClientConfig::new(url), None).unwrap();
        match client.exchange("tools/list", json!({})).await {
            Err(CoreError::AuthRequired { protected_resource }) => {
                assert!(protected_resource.contains("oauth-protected-resource"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_discovery_runs_then_auth_required_surfaces() {
        static METADATA_HITS: AtomicUsize = AtomicUsize::new(0);
        // One app serving the 401-ing ATP endpoint and both discovery
        // documents.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/atp",
                post(move || async move {
                    (
                        StatusCode::UNAUTHORIZED,
                        [(
                            "WWW-Authenticate",
                            format!(
                                r#"Bearer resource_metadata="http://{}/.well-known/oauth-protected-resource""#,
                                addr
                            ),
                        )],
                    )
                }),
            )
            .route(
                "/.well-known/oauth-protected-resource",
                axum::routing::get(move || async move {
                    METADATA_HITS.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({"authorization_servers": [format!("http://{}", addr)]}))
                }),
            )
            .route(
                "/.well-known/oauth-authorization-server",
                axum::routing::get(move || async move {
                    METADATA_HITS.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({
                        "issuer": format!("http://{}", addr),
                        "authorization_endpoint": format!("http://{}/authorize", addr),
                        "token_endpoint": format!("http://{}/token", addr)
                    }))
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // A client id but neither a secret nor a callback handler: the
        // discovery chain runs, then the challenge surfaces.
        let mut config = ClientConfig::new(format!("http://{}/atp", addr));
        config.oauth.client_id = "cid".into();
        let client = Client::new(config, None).unwrap();
        match client.exchange("tools/list", json!({})).await {
            Err(CoreError::AuthRequired { protected_resource }) => {
                assert!(protected_resource.contains("oauth-protected-resource"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(METADATA_HITS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_token_retries_after_401() {
        static SEEN_BEARER: AtomicUsize = AtomicUsize::new(0);
        let app = Router::new().route(
            "/atp",
            post(|headers: HeaderMap, axum::Json(msg): axum::Json<Value>| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v == "Bearer topsecret")
                    .unwrap_or(false);
                if !authorized {
                    return (
                        StatusCode::UNAUTHORIZED,
                        [("WWW-Authenticate", r#"Bearer resource_metadata="https://rs/meta""#)],
                    )
                        .into_response();
                }
                SEEN_BEARER.fetch_add(1, Ordering::SeqCst);
                match msg["method"].as_str() {
                    Some("initialize") => (
                        [("Mcp-Session-Id", "s")],
                        axum::Json(init_result_body(&msg["id"])),
                    )
                        .into_response(),
                    _ => StatusCode::ACCEPTED.into_response(),
                }
            }),
        );
        let url = serve(app).await;
        let mut config = ClientConfig::new(url);
        // The token is configured but deliberately not pre-applied, so the
        // first initialize draws the 401.
        config.oauth.token = Some("topsecret".into());
        let client = Client::new(config, None).unwrap();
        // new() applies static tokens eagerly; clear to exercise the retry.
        client.wire().set_bearer("stale");
        client.ensure_initialized().await.unwrap();
        assert!(SEEN_BEARER.load(Ordering::SeqCst) >= 1);
    }
}
