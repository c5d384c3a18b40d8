//! Built-in servers federated alongside the configured ones.

mod meta;
mod resources;
mod workspace;

pub use meta::{describe_tool, metadata};
pub use resources::ResourcesServer;
pub use workspace::WorkspaceForwarder;

use nanobot_types::Tool;

/// Server names the registry routes internally instead of over a wire.
pub const BUILTIN_SERVERS: [&str; 4] = ["agents", "resources", "workspace", "meta"];

/// The meta server's published tools.
pub fn meta_tools() -> Vec<Tool> {
    vec![describe_tool()]
}
