//! The resources server: durable blobs behind `nanobot://resource/*`, with
//! `session://*` reads answered from the session store.

use std::sync::Arc;

use base64::Engine;
use dashmap::DashSet;
use nanobot_session::{AttrKey, ResourceStore, Session, SessionStore};
use nanobot_types::{
    CallToolResult, CoreError, ReadResourceResult, Resource, ResourceContents, Tool,
};
use serde_json::{json, Value};

const SUBSCRIPTIONS_ATTR: AttrKey<Arc<DashSet<String>>> = AttrKey::new("resource-subscriptions");

pub struct ResourcesServer {
    store: Arc<ResourceStore>,
    sessions: Arc<dyn SessionStore>,
}

impl ResourcesServer {
    pub fn new(store: Arc<ResourceStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { store, sessions }
    }

    pub fn tools(&self) -> Vec<Tool> {
        vec![
            Tool {
                name: "create_resource".to_string(),
                description: Some(
                    "Create a resource, or update it in place when the name already exists."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "text": {"type": "string"},
                        "blob": {"type": "string", "description": "base64 payload"},
                        "mimeType": {"type": "string"}
                    },
                    "required": ["name"],
                    "additionalProperties": false
                }),
                ..Default::default()
            },
            Tool {
                name: "delete_resource".to_string(),
                description: Some("Delete a resource by its URI.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "uri": {"type": "string"}
                    },
                    "required": ["uri"],
                    "additionalProperties": false
                }),
                ..Default::default()
            },
        ]
    }

    pub async fn call(
        &self,
        session: &Arc<Session>,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, CoreError> {
        match tool {
            "create_resource" => self.create(session, arguments).await,
            "delete_resource" => self.delete(session, arguments).await,
            other => Err(CoreError::invalid_params(format!(
                "resources server has no tool {:?}",
                other
            ))),
        }
    }

    async fn create(
        &self,
        session: &Arc<Session>,
        arguments: Value,
    ) -> Result<CallToolResult, CoreError> {
        let name = arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::invalid_params("create_resource requires name"))?;
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
        let blob = arguments
            .get("blob")
            .and_then(Value::as_str)
            .map(|raw| {
                base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .map_err(|e| CoreError::invalid_params(format!("blob is not base64: {}", e)))
            })
            .transpose()?;
        let mime_type = arguments
            .get("mimeType")
            .and_then(Value::as_str)
            .map(str::to_string);

        let stored = self
            .store
            .create(&session.account(), session.id(), name, mime_type, text, blob)
            .map_err(CoreError::from)?;
        self.notify_updated(session, &stored.uri()).await;

        Ok(CallToolResult {
            is_error: false,
            content: vec![nanobot_types::Content::text(stored.uri())],
            structured_content: Some(json!({
                "uri": stored.uri(),
                "mimeType": stored.mime_type,
                "size": stored.size,
            })),
        })
    }

    async fn delete(
        &self,
        session: &Arc<Session>,
        arguments: Value,
    ) -> Result<CallToolResult, CoreError> {
        let uri = arguments
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::invalid_params("delete_resource requires uri"))?;
        let deleted = self
            .store
            .delete(&session.account(), uri)
            .map_err(CoreError::from)?;
        if deleted {
            self.notify_updated(session, uri).await;
            Ok(CallToolResult::text(format!("deleted {}", uri)))
        } else {
            Ok(CallToolResult::error(format!("no such resource {}", uri)))
        }
    }

    pub fn list(&self, session: &Arc<Session>) -> Result<Vec<Resource>, CoreError> {
        Ok(self
            .store
            .list(&session.account(), session.id())
            .map_err(CoreError::from)?
            .iter()
            .map(|r| r.to_resource())
            .collect())
    }

    /// `resources/read` for the schemes this server owns.
    pub async fn read(
        &self,
        session: &Arc<Session>,
        uri: &str,
    ) -> Result<ReadResourceResult, CoreError> {
        if let Some(session_id) = uri.strip_prefix("session://") {
            let state = self
                .sessions
                .peek(session_id)
                .await
                .map_err(CoreError::from)?
                .ok_or_else(|| {
                    CoreError::invalid_params(format!("unknown session {:?}", session_id))
                })?;
            return Ok(ReadResourceResult {
                contents: vec![ResourceContents {
                    uri: uri.to_string(),
                    name: Some(session_id.to_string()),
                    mime_type: Some("application/json".to_string()),
                    text: Some(serde_json::to_string_pretty(&state)?),
                    blob: None,
                }],
            });
        }

        let stored = self
            .store
            .read(&session.account(), uri)
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::invalid_params(format!("unknown resource {:?}", uri)))?;
        Ok(ReadResourceResult {
            contents: vec![stored.to_contents()],
        })
    }

    fn subscriptions(&self, session: &Arc<Session>) -> Arc<DashSet<String>> {
        session.with_attrs(|attrs| match attrs.get(&SUBSCRIPTIONS_ATTR) {
            Some(set) => set,
            None => {
                let set: Arc<DashSet<String>> = Arc::new(DashSet::new());
                attrs.set(&SUBSCRIPTIONS_ATTR, set.clone());
                set
            }
        })
    }

    pub fn subscribe(&self, session: &Arc<Session>, uri: &str) {
        self.subscriptions(session).insert(uri.to_string());
    }

    pub fn unsubscribe(&self, session: &Arc<Session>, uri: &str) {
        self.subscriptions(session).remove(uri);
    }

    async fn notify_updated(&self, session: &Arc<Session>, uri: &str) {
        if self.subscriptions(session).contains(uri) {
            let _ = session
                .send_payload("notifications/resources/updated", json!({"uri": uri}))
                .await;
        }
    }
}
