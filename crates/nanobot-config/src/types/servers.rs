//! Downstream ATP server declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// OAuth coordinates for reaching a protected server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOAuth {
    #[serde(default)]
    pub client_id: String,
    /// Resolved secret value; config loading is expected to have expanded
    /// any `${VAR}` reference before the document reaches the runtime.
    #[serde(default)]
    pub client_secret: String,
    /// RFC 8693 token-exchange endpoint, when the deployment brokers
    /// downstream credentials from inbound ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_exchange_url: Option<String>,
    /// Static bearer that skips the interactive flow entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ServerOAuth {
    pub fn is_empty(&self) -> bool {
        self.client_id.is_empty()
            && self.client_secret.is_empty()
            && self.token_exchange_url.is_none()
            && self.token.is_none()
    }
}

/// One downstream server the registry may federate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "ServerOAuth::is_empty")]
    pub oauth: ServerOAuth,
    /// Hook tags matched for traffic to this server.
    #[serde(default)]
    pub hooks: Vec<String>,
}
