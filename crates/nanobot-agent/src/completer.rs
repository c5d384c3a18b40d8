//! The model capability boundary.

use async_trait::async_trait;
use nanobot_types::CoreError;
use tokio::sync::mpsc;

use crate::types::{CompletionItem, CompletionRequest, CompletionResponse};

/// Receives partial items while a completion is running. The engine turns
/// them into `notifications/progress` frames under the caller's token.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<CompletionItem>,
}

impl ProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletionItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit one partial item; silently dropped once the turn is over.
    pub fn emit(&self, item: CompletionItem) {
        let _ = self.tx.send(item);
    }
}

/// Produces model completions. The core never implements a model; providers
/// plug in behind this trait.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
        progress: &ProgressSink,
    ) -> Result<CompletionResponse, CoreError>;
}
