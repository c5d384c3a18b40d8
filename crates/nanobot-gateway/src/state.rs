//! Shared gateway state.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use nanobot_config::Config;
use nanobot_hooks::HookPipeline;
use nanobot_session::{Session, SessionStore};
use nanobot_tools::HandlerTree;
use nanobot_wire::CallbackState;

use crate::audit::AuditCollector;
use crate::health::HealthState;
use crate::sse::EventRing;

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub store: Arc<dyn SessionStore>,
    pub handler: Arc<HandlerTree>,
    pub hooks: Arc<HookPipeline>,
    pub callbacks: Arc<CallbackState>,
    pub audit: Arc<AuditCollector>,
    pub health: Arc<HealthState>,
    /// ATP endpoint path, for the auth challenge.
    pub endpoint_path: Arc<String>,
    /// Per-session SSE replay rings.
    pub rings: Arc<DashMap<String, Arc<EventRing>>>,
    /// Sessions with a live event-stream reader; one per session.
    pub sse_readers: Arc<DashSet<String>>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn SessionStore>,
        handler: Arc<HandlerTree>,
        callbacks: Arc<CallbackState>,
        audit: Arc<AuditCollector>,
        endpoint_path: String,
    ) -> Self {
        let hooks = Arc::new(HookPipeline::new(config.hooks.clone()));
        Self {
            config,
            store,
            handler,
            hooks,
            callbacks,
            audit,
            health: Arc::new(HealthState::new()),
            endpoint_path: Arc::new(endpoint_path),
            rings: Arc::new(DashMap::new()),
            sse_readers: Arc::new(DashSet::new()),
        }
    }

    /// Attach the ephemeral per-request wiring a session needs: the handler
    /// tree and the config hook pipeline.
    pub fn wire_session(&self, session: &Arc<Session>) {
        session.attach_handler(self.handler.clone());
        session.set_hooks(self.hooks.clone());
    }

    pub fn ring_for(&self, session_id: &str) -> Arc<EventRing> {
        self.rings
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(EventRing::new()))
            .value()
            .clone()
    }
}
