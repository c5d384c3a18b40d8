//! The inbound ATP endpoint.
//!
//! One axum router serves the whole surface: POST/GET/DELETE on the ATP
//! endpoint, the OAuth redirect target, and the liveness probe. Every
//! request runs acquire-exchange-release against the session store, every
//! exchange is audited, and the GET side streams the session mailbox as SSE
//! with event-id replay.

mod audit;
mod callback;
mod challenge;
mod endpoint;
mod health;
mod server;
mod sse;
mod state;

pub use audit::{AuditCollector, AuditRecord, AuditSink, TracingAuditSink};
pub use challenge::challenge_header;
pub use health::HealthState;
pub use server::{router, run, GatewayConfig};
pub use sse::EventRing;
pub use state::GatewayState;
