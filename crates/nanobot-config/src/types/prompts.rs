//! Locally defined prompts served from the meta server.

use serde::{Deserialize, Serialize};

use nanobot_types::PromptArgument;

/// A prompt template with `{{name}}` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

impl PromptConfig {
    /// Render the template against the supplied argument map.
    pub fn render(&self, args: &serde_json::Value) -> String {
        let mut out = self.template.clone();
        if let Some(map) = args.as_object() {
            for (key, value) in map {
                let needle = format!("{{{{{}}}}}", key);
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&needle, &text);
            }
        }
        out
    }
}
