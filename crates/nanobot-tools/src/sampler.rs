//! Sampling capability, injected by the agent layer.

use std::sync::Arc;

use async_trait::async_trait;
use nanobot_session::Session;
use nanobot_types::{CoreError, SamplingParams, SamplingResult};

/// Serves `sampling/createMessage` requests.
///
/// Defined here and injected into the registry with a setter so the tool
/// layer never depends on the agent crate.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn create_message(
        &self,
        session: &Arc<Session>,
        params: SamplingParams,
    ) -> Result<SamplingResult, CoreError>;
}
