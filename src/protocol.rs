//! Wire types for the cloud channel, the local control channel, and the
//! provider subprocess line protocol.
//!
//! Every frame on the cloud and local channels is a tagged union
//! `{"type": <string>, "payload": <object>}`. Provider subprocesses speak
//! line-delimited JSON over their standard streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_true() -> bool {
    true
}

/// Tool definition as carried in the merged catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool name, globally unique across the merged catalogue
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Opaque JSON-schema shaped input description
    #[serde(default = "empty_object")]
    pub input_schema: Value,
}

// ---------------------------------------------------------------------------
// Cloud channel frames
// ---------------------------------------------------------------------------

/// A frame on the cloud channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    /// Capability announcement (outbound)
    RegisterTools(RegisterToolsPayload),
    /// Announcement acknowledgement (inbound)
    Ack(AckPayload),
    /// Tool invocation request (inbound)
    ToolCall(ToolCallPayload),
    /// Tool invocation result (outbound)
    ToolResult(ToolResultPayload),
    /// Application-level liveness (outbound)
    Heartbeat(HeartbeatPayload),
    /// Error report (either direction)
    Error(ErrorPayload),
    /// Graceful goodbye (outbound)
    Disconnect {},
    /// Add a provider (inbound supervisory command)
    AddServer(AddServerPayload),
    /// Remove a provider (inbound supervisory command)
    RemoveServer(RemoveServerPayload),
    /// Enable or disable a provider (inbound supervisory command)
    ToggleServer(ToggleServerPayload),
    /// Supervisory command acknowledgement (outbound)
    ServerCommandAck(ServerCommandAckPayload),
    /// State synchronization snapshot (outbound)
    SyncState(SyncStatePayload),
    /// Memory update pushed by the cloud (inbound, logged only)
    MemoryUpdate(Value),
    /// Persona update pushed by the cloud (inbound)
    PersonaSync(Value),
    /// Cloud asks for a `sync_state` frame (inbound)
    RequestSync(Value),
}

impl Frame {
    /// Frame type tag, for logging.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RegisterTools(_) => "register_tools",
            Self::Ack(_) => "ack",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::Heartbeat(_) => "heartbeat",
            Self::Error(_) => "error",
            Self::Disconnect {} => "disconnect",
            Self::AddServer(_) => "add_server",
            Self::RemoveServer(_) => "remove_server",
            Self::ToggleServer(_) => "toggle_server",
            Self::ServerCommandAck(_) => "server_command_ack",
            Self::SyncState(_) => "sync_state",
            Self::MemoryUpdate(_) => "memory_update",
            Self::PersonaSync(_) => "persona_sync",
            Self::RequestSync(_) => "request_sync",
        }
    }
}

/// Payload of `register_tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterToolsPayload {
    /// Stable identifier of this bridge installation
    pub client_id: String,
    /// Bridge version
    pub client_version: String,
    /// Operating system tag
    pub platform: String,
    /// Flattened tool catalogue
    pub tools: Vec<WireTool>,
    /// Configured provider descriptors
    pub servers: Vec<WireServer>,
}

/// One tool as announced to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTool {
    /// Tool name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Input schema
    #[serde(default = "empty_object")]
    pub parameters: Value,
    /// Owning provider; absent for core tools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// One provider descriptor as announced to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireServer {
    /// Provider name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Executable
    pub command: String,
    /// Argument vector
    #[serde(default)]
    pub args: Vec<String>,
    /// Transport kind (currently always "stdio")
    #[serde(rename = "type")]
    pub kind: String,
    /// Enabled flag
    pub enabled: bool,
}

/// Payload of the inbound `ack` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    /// Acknowledgement status, "ok" on success
    pub status: String,
    /// Number of tools the cloud registered
    #[serde(default)]
    pub tools_registered: u32,
}

/// Payload of an inbound `tool_call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    /// Cloud-assigned correlation id
    #[serde(default)]
    pub call_id: String,
    /// Tool to invoke
    #[serde(default)]
    pub tool_name: String,
    /// Argument mapping
    #[serde(default = "empty_object")]
    pub arguments: Value,
    /// Deadline in seconds, if the cloud set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Payload of an outbound `tool_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPayload {
    /// Correlation id copied from the `tool_call`
    pub call_id: String,
    /// Whether the invocation succeeded
    pub success: bool,
    /// Serialized result, empty on failure
    #[serde(default)]
    pub result: String,
    /// Error string, empty on success
    #[serde(default)]
    pub error: String,
}

impl ToolResultPayload {
    /// Successful result.
    #[must_use]
    pub fn ok(call_id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            result: result.into(),
            error: String::new(),
        }
    }

    /// Failed result.
    #[must_use]
    pub fn fail(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            result: String::new(),
            error: error.into(),
        }
    }
}

/// Payload of an outbound `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl HeartbeatPayload {
    /// Heartbeat stamped with the current wall clock.
    #[must_use]
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error message
    #[serde(default)]
    pub message: String,
}

/// Payload of an inbound `add_server` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddServerPayload {
    /// Correlation id for the `server_command_ack`
    #[serde(default)]
    pub request_id: String,
    /// Provider name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Executable or command line
    pub command: String,
    /// Argument vector
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether to start the provider immediately
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Payload of an inbound `remove_server` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveServerPayload {
    /// Correlation id for the `server_command_ack`
    #[serde(default)]
    pub request_id: String,
    /// Provider name
    pub name: String,
}

/// Payload of an inbound `toggle_server` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleServerPayload {
    /// Correlation id for the `server_command_ack`
    #[serde(default)]
    pub request_id: String,
    /// Provider name
    pub name: String,
    /// Desired state; absent means "flip"
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Payload of an outbound `server_command_ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCommandAckPayload {
    /// Correlation id copied from the command
    pub request_id: String,
    /// Whether the command was applied
    pub success: bool,
    /// Error string, empty on success
    #[serde(default)]
    pub error: String,
}

/// Payload of an outbound `sync_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatePayload {
    /// Memory entries (opaque to the bridge)
    #[serde(default)]
    pub memories: Value,
    /// Persona document (opaque to the bridge)
    #[serde(default)]
    pub persona: Value,
    /// Skill list (opaque to the bridge)
    #[serde(default)]
    pub skills: Value,
}

impl Default for SyncStatePayload {
    fn default() -> Self {
        Self {
            memories: Value::Array(vec![]),
            persona: empty_object(),
            skills: Value::Array(vec![]),
        }
    }
}

// ---------------------------------------------------------------------------
// Local control channel frames
// ---------------------------------------------------------------------------

/// A frame on the local control channel, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LocalFrame {
    /// Bridge status snapshot (pushed on connect and on every change)
    Status(StatusPayload),
    /// Activity record broadcast after each dispatched invocation
    Activity(ActivityRecord),
    /// Add a provider
    AddServer(AddServerPayload),
    /// Remove a provider
    RemoveServer(RemoveServerPayload),
    /// Enable or disable a provider
    ToggleServer(ToggleServerPayload),
    /// Ask the bridge to shut down
    Shutdown {},
    /// Liveness probe
    Ping {},
    /// Liveness reply
    Pong {},
    /// Command succeeded
    Ok {},
    /// Command failed
    Error(ErrorPayload),
}

/// Bridge status snapshot shared with local clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Bridge version
    pub version: String,
    /// Connection state: idle, connecting, connected, reconnecting,
    /// auth_failed, terminated
    pub connection: String,
    /// Cloud endpoint
    pub cloud_url: String,
    /// Registered device identity, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Whether usable credentials are present
    pub auth_ok: bool,
    /// Per-provider state
    pub providers: Vec<ProviderStatus>,
    /// Seconds since the orchestrator started
    pub uptime_secs: u64,
}

/// Per-provider entry in the status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Provider name
    pub name: String,
    /// Configured enabled flag
    pub enabled: bool,
    /// Whether a live subprocess exists
    pub running: bool,
    /// Number of tools the provider contributed
    pub tools: usize,
    /// Last start/handshake error, empty when healthy
    #[serde(default)]
    pub error: String,
}

/// One entry of the bounded activity ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Cloud call id
    pub call_id: String,
    /// Tool name
    pub tool: String,
    /// Origin tag: "core" or the provider name
    pub origin: String,
    /// Elided argument summary
    pub args_summary: String,
    /// Success flag
    pub success: bool,
    /// Error string, empty on success
    #[serde(default)]
    pub error: String,
    /// Wall-clock latency
    pub latency_ms: u64,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Provider subprocess line protocol
// ---------------------------------------------------------------------------

/// A request line written to a provider's standard input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProviderRequest {
    /// Enumerate the provider's tools
    ListTools {},
    /// Invoke one tool
    CallTool {
        /// Tool name
        name: String,
        /// Argument mapping
        arguments: Value,
    },
}

/// Response line to a `list_tools` request.
#[derive(Debug, Clone, Deserialize)]
pub struct EnumerateResponse {
    /// Tools offered by the provider
    pub tools: Vec<ToolDef>,
}

/// Response line to a `call_tool` request.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeResponse {
    /// Serialized result on success
    #[serde(default)]
    pub result: Option<String>,
    /// Error string on failure
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_call_frame_round_trip() {
        let line = r#"{"type":"tool_call","payload":{"call_id":"c1","tool_name":"read_file","arguments":{"path":"/tmp/x"},"timeout":30}}"#;
        let frame: Frame = serde_json::from_str(line).unwrap();
        let Frame::ToolCall(call) = frame else {
            panic!("expected tool_call");
        };
        assert_eq!(call.call_id, "c1");
        assert_eq!(call.tool_name, "read_file");
        assert_eq!(call.arguments, json!({"path": "/tmp/x"}));
        assert_eq!(call.timeout, Some(30));
    }

    #[test]
    fn tool_result_frame_shape() {
        let frame = Frame::ToolResult(ToolResultPayload::ok("c1", "hello"));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "tool_result");
        assert_eq!(value["payload"]["call_id"], "c1");
        assert_eq!(value["payload"]["success"], true);
        assert_eq!(value["payload"]["result"], "hello");
        assert_eq!(value["payload"]["error"], "");
    }

    #[test]
    fn register_tools_frame_shape() {
        let frame = Frame::RegisterTools(RegisterToolsPayload {
            client_id: "dev-1".into(),
            client_version: "0.4.1".into(),
            platform: "linux".into(),
            tools: vec![WireTool {
                name: "read_file".into(),
                description: String::new(),
                parameters: json!({}),
                server_name: Some("fs".into()),
            }],
            servers: vec![WireServer {
                name: "fs".into(),
                description: String::new(),
                command: "fs-provider".into(),
                args: vec![],
                kind: "stdio".into(),
                enabled: true,
            }],
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "register_tools");
        assert_eq!(value["payload"]["tools"][0]["server_name"], "fs");
        assert_eq!(value["payload"]["servers"][0]["type"], "stdio");
    }

    #[test]
    fn core_tools_omit_server_name() {
        let tool = WireTool {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({}),
            server_name: None,
        };
        let value = serde_json::to_value(&tool).unwrap();
        assert!(value.get("server_name").is_none());
    }

    #[test]
    fn disconnect_frame_has_empty_payload() {
        let value = serde_json::to_value(Frame::Disconnect {}).unwrap();
        assert_eq!(value["type"], "disconnect");
        assert_eq!(value["payload"], json!({}));
    }

    #[test]
    fn ack_frame_parses() {
        let line = r#"{"type":"ack","payload":{"status":"ok","tools_registered":3}}"#;
        let frame: Frame = serde_json::from_str(line).unwrap();
        let Frame::Ack(ack) = frame else {
            panic!("expected ack");
        };
        assert_eq!(ack.status, "ok");
        assert_eq!(ack.tools_registered, 3);
    }

    #[test]
    fn local_ping_pong_round_trip() {
        let ping = serde_json::to_string(&LocalFrame::Ping {}).unwrap();
        assert_eq!(ping, r#"{"type":"ping","payload":{}}"#);
        let parsed: LocalFrame = serde_json::from_str(&ping).unwrap();
        assert!(matches!(parsed, LocalFrame::Ping {}));
        let pong = serde_json::to_value(LocalFrame::Pong {}).unwrap();
        assert_eq!(pong["type"], "pong");
    }

    #[test]
    fn provider_request_lines() {
        let list = serde_json::to_string(&ProviderRequest::ListTools {}).unwrap();
        assert_eq!(list, r#"{"op":"list_tools"}"#);

        let call = serde_json::to_string(&ProviderRequest::CallTool {
            name: "read_file".into(),
            arguments: json!({"path": "/tmp/x"}),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&call).unwrap();
        assert_eq!(value["op"], "call_tool");
        assert_eq!(value["name"], "read_file");
        assert_eq!(value["arguments"]["path"], "/tmp/x");
    }

    #[test]
    fn provider_enumerate_response_defaults() {
        let line = r#"{"tools":[{"name":"read_file"}]}"#;
        let response: EnumerateResponse = serde_json::from_str(line).unwrap();
        assert_eq!(response.tools.len(), 1);
        assert_eq!(response.tools[0].name, "read_file");
        assert_eq!(response.tools[0].description, "");
        assert_eq!(response.tools[0].input_schema, json!({}));
    }

    #[test]
    fn provider_invoke_response_variants() {
        let ok: InvokeResponse = serde_json::from_str(r#"{"result":"hello"}"#).unwrap();
        assert_eq!(ok.result.as_deref(), Some("hello"));
        assert!(ok.error.is_none());

        let failed: InvokeResponse = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
