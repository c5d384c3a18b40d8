//! Semantic validation beyond what serde enforces.

use std::fmt;

use crate::types::Config;

/// A validation failure with the offending field path.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Config {
    /// Validate the whole document, collecting every violation rather than
    /// stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (name, server) in &self.mcp_servers {
            if server.url.is_empty() {
                errors.push(ValidationError {
                    path: format!("mcpServers.{}.url", name),
                    message: "url must not be empty".to_string(),
                });
            }
        }

        for (name, agent) in &self.agents {
            for reference in agent.tools.iter().chain(agent.mcp_servers.iter()) {
                let server = reference
                    .split(':')
                    .next()
                    .unwrap_or(reference)
                    .split('/')
                    .next()
                    .unwrap_or(reference);
                if !self.mcp_servers.contains_key(server) && !self.agents.contains_key(server) {
                    errors.push(ValidationError {
                        path: format!("agents.{}.tools", name),
                        message: format!("reference {:?} names no configured server", reference),
                    });
                }
            }
            for other in &agent.agents {
                if !self.agents.contains_key(other) {
                    errors.push(ValidationError {
                        path: format!("agents.{}.agents", name),
                        message: format!("unknown agent {:?}", other),
                    });
                }
            }
        }

        for (idx, hook) in self.hooks.iter().enumerate() {
            if hook.name.is_empty() {
                errors.push(ValidationError {
                    path: format!("hooks[{}].name", idx),
                    message: "hook name must not be empty".to_string(),
                });
            }
            if hook.url.is_empty() {
                errors.push(ValidationError {
                    path: format!("hooks[{}].url", idx),
                    message: "hook url must not be empty".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
