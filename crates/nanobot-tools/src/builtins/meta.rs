//! Static runtime metadata and config-derived lists.

use nanobot_config::Config;
use nanobot_types::Tool;
use serde_json::{json, Value};

pub fn metadata(config: &Config) -> Value {
    json!({
        "name": if config.publish.name.is_empty() { "nanobot" } else { &config.publish.name },
        "version": if config.publish.version.is_empty() {
            env!("CARGO_PKG_VERSION")
        } else {
            &config.publish.version
        },
        "agents": config.agents.keys().collect::<Vec<_>>(),
        "mcpServers": config.mcp_servers.keys().collect::<Vec<_>>(),
        "prompts": config.prompts.keys().collect::<Vec<_>>(),
    })
}

pub fn describe_tool() -> Tool {
    Tool {
        name: "describe".to_string(),
        description: Some("Describe this nanobot instance and its configuration.".to_string()),
        input_schema: json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_lists_config_names() {
        let config: Config = serde_json::from_value(json!({
            "agents": {"a": {}},
            "mcpServers": {"s": {"url": "https://x/atp"}},
            "prompts": {"p": {"template": "t"}}
        }))
        .unwrap();
        let meta = metadata(&config);
        assert_eq!(meta["agents"], json!(["a"]));
        assert_eq!(meta["mcpServers"], json!(["s"]));
        assert_eq!(meta["prompts"], json!(["p"]));
        assert_eq!(meta["name"], "nanobot");
    }

    #[test]
    fn test_publish_overrides_identity() {
        let config: Config = serde_json::from_value(json!({
            "publish": {"name": "custom", "version": "9.9"}
        }))
        .unwrap();
        let meta = metadata(&config);
        assert_eq!(meta["name"], "custom");
        assert_eq!(meta["version"], "9.9");
    }
}
