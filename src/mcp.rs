//! Tool-protocol adapter registration.
//!
//! The out-of-process adapter is a Node program the IDE launches; this
//! daemon keeps `~/.cursor/mcp.json` pointing at the bundled copy so
//! the IDE picks it up after a reload.

use crate::error::Result;

use serde_json::{Value, json};
use std::path::{Path, PathBuf};

/// Key under `mcpServers` owned by this bridge.
pub const SERVER_KEY: &str = "discord-bridge";

/// Default location of the adapter config file.
pub fn adapter_config_path() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".cursor").join("mcp.json"))
}

/// Ensure the config file references the bundled adapter. Returns true
/// when the file was (re)written; the caller should then request a
/// host reload.
pub fn ensure_adapter_config(config_path: &Path, adapter_path: &Path) -> Result<bool> {
    let desired = json!({
        "command": "node",
        "args": [adapter_path.to_string_lossy()],
    });

    let mut root: Value = match std::fs::read_to_string(config_path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|_| json!({})),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => json!({}),
        Err(error) => return Err(error.into()),
    };

    if root["mcpServers"][SERVER_KEY] == desired {
        return Ok(false);
    }

    if !root["mcpServers"].is_object() {
        root["mcpServers"] = json!({});
    }
    root["mcpServers"][SERVER_KEY] = desired;

    write_atomic(config_path, &serde_json::to_string_pretty(&root)?)?;
    tracing::info!(path = %config_path.display(), "adapter config written");
    Ok(true)
}

/// Write-then-rename so a crashed write never leaves a torn file.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, contents)?;
    std::fs::rename(&temp, path)?;
    Ok(())
}
