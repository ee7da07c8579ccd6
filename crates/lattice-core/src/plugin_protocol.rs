use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PLUGIN_PROTOCOL_VERSION: u32 = 1;

/// One JSON line exchanged with an out-of-process plugin worker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginWireMessage {
    Handshake {
        protocol_version: u32,
        #[serde(default)]
        supported_protocol_versions: Vec<u32>,
        plugin_id: String,
        plugin_version: String,
        #[serde(default)]
        hooks: Vec<String>,
        #[serde(default)]
        tick: bool,
    },
    HandshakeAck {
        protocol_version: u32,
        accepted: bool,
        reason: Option<String>,
        #[serde(default)]
        reported_hooks: Vec<String>,
    },
    Init {
        request_id: String,
        timeout_ms: u64,
    },
    InitResult {
        request_id: String,
        ok: bool,
        reason: Option<String>,
    },
    Hook {
        request_id: String,
        hook: String,
        #[serde(default)]
        payload: Value,
    },
    Tick {
        request_id: String,
    },
    CallResult {
        request_id: String,
        ok: bool,
        error: Option<String>,
    },
    Ping {
        request_id: String,
    },
    Pong {
        request_id: String,
    },
    Cancel {
        request_id: String,
        reason: String,
    },
    Shutdown,
}

impl PluginWireMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Init { request_id, .. }
            | Self::InitResult { request_id, .. }
            | Self::Hook { request_id, .. }
            | Self::Tick { request_id }
            | Self::CallResult { request_id, .. }
            | Self::Ping { request_id }
            | Self::Pong { request_id }
            | Self::Cancel { request_id, .. } => Some(request_id),
            Self::Handshake { .. } | Self::HandshakeAck { .. } | Self::Shutdown => None,
        }
    }
}
