//! Tool and resource federation.
//!
//! The [`ToolRegistry`] aggregates the declared downstream ATP servers plus
//! the built-in servers behind one namespaced tool surface, with lazily
//! connected clients cached per session and bounded concurrent fan-out. The
//! [`HandlerTree`] is the per-session dispatcher behind the inbound HTTP
//! endpoint, routing each method to a built-in server or the registry.

mod builtins;
mod handler;
mod refs;
mod registry;
mod sampler;

pub use builtins::{meta_tools, BUILTIN_SERVERS};
pub use handler::{ChatDriver, ChatRequest, HandlerTree};
pub use refs::ToolRef;
pub use registry::{
    BuiltinRouter, ToolMapping, ToolRegistry, DEFAULT_MAX_CONCURRENCY, SUBJECT_TOKEN_ATTR,
};
pub use sampler::Sampler;
