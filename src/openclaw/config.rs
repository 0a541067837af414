use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;

fn parse_config_text(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(v) => Ok(v),
        Err(_) => json5::from_str::<Value>(raw).context("failed to parse config as JSON/JSON5"),
    }
}

pub fn read_config_value(config_path: &Path) -> Result<Value> {
    if !config_path.exists() {
        return Ok(json!({}));
    }
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("failed reading {}", config_path.display()))?;
    parse_config_text(&raw)
}

/// Walks `gateway.auth.token`-style paths; only string leaves count.
pub fn lookup_dotted_string(root: &Value, dotted: &str) -> Option<String> {
    let mut cursor = root;
    for key in dotted.split('.').filter(|k| !k.is_empty()) {
        cursor = cursor.as_object()?.get(key)?;
    }
    cursor.as_str().map(ToOwned::to_owned)
}
