//! Environment variable substitution over the config document.
//!
//! Supports `${VAR}` (required) and `${VAR:-default}` in every string value
//! of the document tree. Values come from the supplied map, which the caller
//! builds by overlaying the session env over the process env.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::Value;

/// Recursively expand `${VAR}` references in all string values of `value`.
pub fn expand_env_vars(value: &mut Value, env: &BTreeMap<String, String>) -> Result<()> {
    match value {
        Value::String(s) => {
            *s = expand_string(s, env)
                .with_context(|| format!("expanding env refs in {:?}", s))?;
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                expand_env_vars(item, env)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                expand_env_vars(item, env)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_string(input: &str, env: &BTreeMap<String, String>) -> Result<String> {
    // ${VAR} or ${VAR:-default}; default may be empty.
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex");
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in pattern.captures_iter(input) {
        let whole = caps.get(0).expect("match");
        let name = &caps[1];
        out.push_str(&input[last..whole.start()]);
        match (env.get(name), caps.get(2)) {
            (Some(value), _) => out.push_str(value),
            (None, Some(default)) => out.push_str(default.as_str()),
            (None, None) => bail!("environment variable {} is not set", name),
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
