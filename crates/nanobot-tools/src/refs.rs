//! Tool reference parsing: `server[/tool][:alias]`.

use nanobot_types::CoreError;

/// A parsed tool reference from agent or publish config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRef {
    pub server: String,
    /// Specific tool at the server; `None` selects the whole catalogue.
    pub tool: Option<String>,
    /// Name the tool is published under, overriding the namespaced default.
    pub alias: Option<String>,
}

impl ToolRef {
    pub fn parse(reference: &str) -> Result<Self, CoreError> {
        let (body, alias) = match reference.rsplit_once(':') {
            Some((body, alias)) if !alias.is_empty() && !alias.contains('/') => {
                (body, Some(alias.to_string()))
            }
            _ => (reference, None),
        };
        let (server, tool) = match body.split_once('/') {
            Some((server, tool)) => (server, Some(tool.to_string())),
            None => (body, None),
        };
        if server.is_empty() || tool.as_deref() == Some("") {
            return Err(CoreError::invalid_params(format!(
                "malformed tool reference {:?}",
                reference
            )));
        }
        Ok(Self {
            server: server.to_string(),
            tool,
            alias,
        })
    }
}

impl std::fmt::Display for ToolRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.server)?;
        if let Some(tool) = &self.tool {
            write!(f, "/{}", tool)?;
        }
        if let Some(alias) = &self.alias {
            write!(f, ":{}", alias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_server() {
        let r = ToolRef::parse("search").unwrap();
        assert_eq!(r.server, "search");
        assert_eq!(r.tool, None);
        assert_eq!(r.alias, None);
    }

    #[test]
    fn test_server_and_tool() {
        let r = ToolRef::parse("search/find").unwrap();
        assert_eq!(r.server, "search");
        assert_eq!(r.tool.as_deref(), Some("find"));
    }

    #[test]
    fn test_server_tool_alias() {
        let r = ToolRef::parse("search/find:lookup").unwrap();
        assert_eq!(r.server, "search");
        assert_eq!(r.tool.as_deref(), Some("find"));
        assert_eq!(r.alias.as_deref(), Some("lookup"));
    }

    #[test]
    fn test_alias_without_tool() {
        let r = ToolRef::parse("search:web").unwrap();
        assert_eq!(r.server, "search");
        assert_eq!(r.tool, None);
        assert_eq!(r.alias.as_deref(), Some("web"));
    }

    #[test]
    fn test_malformed_references_rejected() {
        assert!(ToolRef::parse("").is_err());
        assert!(ToolRef::parse("server/").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["s", "s/t", "s/t:a", "s:a"] {
            assert_eq!(ToolRef::parse(raw).unwrap().to_string(), raw);
        }
    }
}
