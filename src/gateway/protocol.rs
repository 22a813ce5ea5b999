//! Discord Gateway v10 wire types.
//!
//! Only the opcodes the session needs are modelled; dispatch payloads
//! pass through as opaque JSON.

use serde::{Deserialize, Serialize};

pub(crate) mod opcode {
    pub(crate) const DISPATCH: u8 = 0;
    pub(crate) const HEARTBEAT: u8 = 1;
    pub(crate) const IDENTIFY: u8 = 2;
    pub(crate) const RESUME: u8 = 6;
    pub(crate) const RECONNECT: u8 = 7;
    pub(crate) const INVALID_SESSION: u8 = 9;
    pub(crate) const HELLO: u8 = 10;
    pub(crate) const HEARTBEAT_ACK: u8 = 11;
}

pub(crate) mod close_code {
    pub(crate) const AUTHENTICATION_FAILED: u16 = 4004;
    pub(crate) const INVALID_INTENTS: u16 = 4013;
    pub(crate) const DISALLOWED_INTENTS: u16 = 4014;
}

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT.
///
/// MESSAGE_CONTENT is privileged and must be enabled in the developer
/// portal; thread text cannot be mirrored without it.
pub(crate) const INTENTS: u32 = (1 << 0) | (1 << 9) | (1 << 15);

/// Raw frame exchanged with the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub op: u8,
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Ready {
    pub session_id: String,
    pub resume_gateway_url: String,
    pub user: ReadyUser,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadyUser {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayBot {
    pub url: String,
}

pub(crate) fn identify(token: &str) -> Frame {
    Frame {
        op: opcode::IDENTIFY,
        d: Some(serde_json::json!({
            "token": token,
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "bridgebot",
                "device": "bridgebot",
            },
        })),
        s: None,
        t: None,
    }
}

pub(crate) fn resume(token: &str, session_id: &str, sequence: u64) -> Frame {
    Frame {
        op: opcode::RESUME,
        d: Some(serde_json::json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        })),
        s: None,
        t: None,
    }
}

pub(crate) fn heartbeat(sequence: Option<u64>) -> Frame {
    Frame {
        op: opcode::HEARTBEAT,
        d: sequence.map(serde_json::Value::from),
        s: None,
        t: None,
    }
}

/// Dispatch event names the bridge reacts to; everything else is
/// dropped at the session layer.
pub(crate) fn is_relayed_event(name: &str) -> bool {
    matches!(
        name,
        "MESSAGE_CREATE" | "THREAD_UPDATE" | "INTERACTION_CREATE"
    )
}
