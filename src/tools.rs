//! Built-in core tools
//!
//! A deliberately small set implemented in-process. Core names shadow
//! same-named provider tools, so additions here are breaking for users.

use serde_json::{Value, json};

use crate::protocol::ToolDef;
use crate::provider::ProviderSupervisor;
use crate::{Error, Result};

/// Definitions of the built-in tool set.
#[must_use]
pub fn core_tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "echo".to_string(),
            description: "Echo the given text back unchanged".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo" }
                },
                "required": ["text"]
            }),
        },
        ToolDef {
            name: "system_info".to_string(),
            description: "Hostname, platform, bridge version and provider summary".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
    ]
}

/// Invoke a core tool by name.
///
/// # Errors
///
/// `ToolNotFound` for names outside the core set, `Tool` for bad arguments.
pub async fn invoke_core(
    tool: &str,
    arguments: &Value,
    supervisor: &ProviderSupervisor,
) -> Result<String> {
    match tool {
        "echo" => {
            let text = arguments
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Tool("echo: missing required argument 'text'".into()))?;
            Ok(text.to_string())
        }
        "system_info" => {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());
            let providers = supervisor.running_names();
            let info = json!({
                "hostname": host,
                "platform": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "version": env!("CARGO_PKG_VERSION"),
                "providers_running": providers,
            });
            Ok(info.to_string())
        }
        other => Err(Error::ToolNotFound(other.to_string())),
    }
}
