//! Sampling service: answers `sampling/createMessage` with the engine's
//! own completer.

use std::sync::Arc;

use async_trait::async_trait;
use nanobot_session::Session;
use nanobot_tools::Sampler;
use nanobot_types::{Content, CoreError, SamplingParams, SamplingResult};

use crate::completer::ProgressSink;
use crate::engine::AgentEngine;
use crate::types::{CompletionItem, CompletionRequest};

/// Bridges peer sampling requests onto the same `Completer` the engine
/// uses. Registered with the registry via setter injection.
pub struct EngineSampler {
    engine: AgentEngine,
}

impl EngineSampler {
    pub fn new(engine: AgentEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Sampler for EngineSampler {
    async fn create_message(
        &self,
        _session: &Arc<Session>,
        params: SamplingParams,
    ) -> Result<SamplingResult, CoreError> {
        let input = params
            .messages
            .iter()
            .map(|m| CompletionItem::Message {
                id: uuid::Uuid::new_v4().to_string(),
                role: m.role.clone(),
                content: vec![m.content.clone()],
            })
            .collect();
        let agent = self
            .engine
            .config
            .chat_agent()
            .map(|(name, _)| name.clone())
            .unwrap_or_default();
        let request = CompletionRequest {
            agent,
            input,
            system_prompt: params.system_prompt.clone(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            ..Default::default()
        };

        // Sampling is a single completion, never a tool loop.
        let (sink, _rx) = ProgressSink::new();
        let response = self.engine.completer.complete(&request, &sink).await?;
        let text = response.assistant_text();
        Ok(SamplingResult {
            role: "assistant".to_string(),
            content: Content::text(text),
            model: if response.model.is_empty() {
                None
            } else {
                Some(response.model)
            },
            stop_reason: Some("endTurn".to_string()),
        })
    }
}
