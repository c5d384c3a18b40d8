//! Conservative recognition of UI actions embedded as JSON in user text.
//!
//! Parsing the last user text as JSON is inherently ambiguous with a user
//! who wants to send literal JSON. The marker is therefore strict: an
//! object whose `type` is in a closed set, carrying a non-empty `payload`
//! object with the required subfield for its type. Anything else is plain
//! text for the model.

use serde_json::Value;

/// A recognised UI action.
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    /// Synthesise a tool call without a model round-trip.
    Tool { tool_name: String, args: Value },
    /// Replace the user message with a prompt's rendered messages.
    PromptRef { prompt_name: String, args: Value },
    /// Replace the user text with inline prompt text.
    PromptInline { prompt: String },
}

const ACTION_TYPES: [&str; 5] = ["tool", "prompt", "link", "notify", "intent"];

/// Try to read a UI action out of the last user text. `None` means the text
/// goes to the model verbatim.
pub fn sniff_ui_action(text: &str) -> Option<UiAction> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let obj = value.as_object()?;
    let action_type = obj.get("type")?.as_str()?;
    if !ACTION_TYPES.contains(&action_type) {
        return None;
    }
    let payload = obj.get("payload")?.as_object()?;
    if payload.is_empty() {
        return None;
    }

    match action_type {
        "tool" => {
            let tool_name = payload.get("toolName")?.as_str()?;
            if tool_name.is_empty() {
                return None;
            }
            Some(UiAction::Tool {
                tool_name: tool_name.to_string(),
                args: payload
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            })
        }
        "prompt" => {
            if let Some(name) = payload.get("promptName").and_then(Value::as_str) {
                if !name.is_empty() {
                    return Some(UiAction::PromptRef {
                        prompt_name: name.to_string(),
                        args: payload
                            .get("args")
                            .cloned()
                            .unwrap_or_else(|| Value::Object(Default::default())),
                    });
                }
            }
            let inline = payload.get("prompt").and_then(Value::as_str)?;
            if inline.is_empty() {
                return None;
            }
            Some(UiAction::PromptInline {
                prompt: inline.to_string(),
            })
        }
        // Recognised, but nothing for the engine to do; the text flows to
        // the model untouched.
        _ => None,
    }
}
