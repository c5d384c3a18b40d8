//! Hook endpoint declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One external interception endpoint.
///
/// `on` holds the tags this hook matches: method names, the synthetic tags
/// `request` and `response`, or user-defined labels referenced from agent
/// and server configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: String,
    #[serde(default)]
    pub on: Vec<String>,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Invoke this hook even when the message being intercepted is an
    /// error response.
    #[serde(default, rename = "callOnError")]
    pub call_on_error: bool,
}
