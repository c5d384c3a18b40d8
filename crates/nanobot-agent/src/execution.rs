//! One turn of the engine's loop, and the input-replay rules.

use std::collections::BTreeMap;

use nanobot_tools::ToolMapping;
use serde::{Deserialize, Serialize};

use crate::types::{
    CompletionItem, CompletionRequest, CompletionResponse, ToolCallOutput,
};

/// One turn: the verbatim request, its populated form, the model response,
/// the tool surface in force, and the dispatch outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub request: CompletionRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub populated: Option<CompletionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CompletionResponse>,
    /// Tool name usable this turn to the server that owns it.
    #[serde(default)]
    pub tool_to_server: BTreeMap<String, ToolMapping>,
    /// Outcome per `call_id`.
    #[serde(default)]
    pub tool_outputs: BTreeMap<String, ToolCallOutput>,
    #[serde(default)]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<Execution>>,
}

impl Execution {
    pub fn new(request: CompletionRequest) -> Self {
        Self {
            request,
            ..Default::default()
        }
    }

    /// Begin the follow-up turn: same agent, empty input (input is replayed
    /// from this execution plus its tool outputs).
    pub fn next_turn(self) -> Self {
        let mut request = self.request.clone();
        request.input = Vec::new();
        request.new_thread = false;
        Self {
            request,
            previous: Some(Box::new(self)),
            ..Default::default()
        }
    }

    /// Replay this execution for the next request: populated input, then the
    /// response output with unanswered tool calls dropped, then completed
    /// tool outputs in `call_id` order.
    pub fn replay(&self) -> Vec<CompletionItem> {
        let mut items = Vec::new();
        if let Some(populated) = &self.populated {
            items.extend(populated.input.iter().cloned());
        }
        if let Some(response) = &self.response {
            for item in &response.output {
                match item {
                    CompletionItem::ToolCall { call_id, .. }
                        if !self.tool_outputs.contains_key(call_id) =>
                    {
                        // Stale tool call: no output ever arrived, so the
                        // replayed transcript must not mention it.
                    }
                    other => items.push(other.clone()),
                }
            }
        }
        // BTreeMap iteration gives call_id sorted order.
        for (call_id, outcome) in &self.tool_outputs {
            if outcome.done {
                items.push(CompletionItem::ToolResult {
                    call_id: call_id.clone(),
                    output: outcome.output.clone(),
                });
            }
        }
        items
    }

    /// Every tool call in the response is answered or tracked as pending.
    pub fn all_calls_resolved(&self) -> bool {
        let Some(response) = &self.response else {
            return true;
        };
        response
            .tool_calls()
            .iter()
            .all(|(call_id, _, _)| {
                self.tool_outputs
                    .get(*call_id)
                    .map(|o| o.done)
                    .unwrap_or(false)
            })
    }

    /// Any call awaiting an external reply?
    pub fn has_pending_external(&self) -> bool {
        self.tool_outputs.values().any(|o| !o.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_types::CallToolResult;
    use serde_json::json;

    fn call(id: &str) -> CompletionItem {
        CompletionItem::ToolCall {
            id: format!("item-{}", id),
            call_id: id.to_string(),
            name: "search".to_string(),
            arguments: json!({}),
        }
    }

    #[test]
    fn test_replay_drops_stale_tool_calls() {
        let mut execution = Execution::new(CompletionRequest::default());
        execution.populated = Some(CompletionRequest {
            input: vec![CompletionItem::user_text("hi")],
            ..Default::default()
        });
        execution.response = Some(CompletionResponse {
            output: vec![call("c1"), call("c2")],
            model: String::new(),
        });
        execution.tool_outputs.insert(
            "c1".to_string(),
            ToolCallOutput {
                done: true,
                output: CallToolResult::text("done"),
            },
        );

        let replayed = execution.replay();
        // user text, the answered call, and its result; c2 vanished.
        assert_eq!(replayed.len(), 3);
        assert!(replayed.iter().all(|item| match item {
            CompletionItem::ToolCall { call_id, .. } => call_id == "c1",
            _ => true,
        }));
    }

    #[test]
    fn test_replay_orders_outputs_by_call_id() {
        let mut execution = Execution::new(CompletionRequest::default());
        execution.response = Some(CompletionResponse {
            output: vec![call("z"), call("a")],
            model: String::new(),
        });
        for id in ["z", "a"] {
            execution.tool_outputs.insert(
                id.to_string(),
                ToolCallOutput {
                    done: true,
                    output: CallToolResult::text(id),
                },
            );
        }
        let replayed = execution.replay();
        let result_ids: Vec<_> = replayed
            .iter()
            .filter_map(|item| match item {
                CompletionItem::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(result_ids, vec!["a", "z"]);
    }

    #[test]
    fn test_all_calls_resolved() {
        let mut execution = Execution::new(CompletionRequest::default());
        execution.response = Some(CompletionResponse {
            output: vec![call("c1")],
            model: String::new(),
        });
        assert!(!execution.all_calls_resolved());
        execution.tool_outputs.insert(
            "c1".to_string(),
            ToolCallOutput {
                done: false,
                output: CallToolResult::default(),
            },
        );
        assert!(!execution.all_calls_resolved());
        execution.tool_outputs.get_mut("c1").unwrap().done = true;
        assert!(execution.all_calls_resolved());
    }

    #[test]
    fn test_next_turn_clears_input_and_links_previous() {
        let mut execution = Execution::new(CompletionRequest {
            agent: "main".into(),
            input: vec![CompletionItem::user_text("hi")],
            ..Default::default()
        });
        execution.done = false;
        let next = execution.next_turn();
        assert!(next.request.input.is_empty());
        assert_eq!(next.request.agent, "main");
        assert_eq!(
            next.previous.as_ref().unwrap().request.input.len(),
            1
        );
    }
}
