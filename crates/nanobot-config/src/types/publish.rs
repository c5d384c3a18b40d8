//! What this instance exposes on its own ATP endpoint.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publish {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Instructions text surfaced in the initialize result.
    #[serde(default)]
    pub instructions: String,
    /// Tool references published verbatim in addition to the built-ins.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}
