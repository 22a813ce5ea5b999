//! bridgebot mirrors IDE agent conversations into Discord threads.
//!
//! Each conversation in the IDE's workspace maps to exactly one public
//! thread in a configured channel. The daemon watches the IDE's local
//! state database for new, renamed, archived, and unarchived
//! conversations and keeps the corresponding threads in sync; messages
//! posted in a thread are injected back into the owning conversation.

pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod ide;
pub mod interaction;
pub mod mcp;
pub mod registry;
pub mod watcher;

pub use error::{BridgeError, Result};

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of an IDE-side conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

/// Discord thread identifier (a channel snowflake).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

/// Discord message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

macro_rules! id_impls {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_impls!(ConversationId);
id_impls!(ThreadId);
id_impls!(MessageId);

/// Persistent binding between one conversation and one thread.
///
/// Created when the thread is created, never removed implicitly. The
/// `claimed_at` timestamp is set once, the first time an external agent
/// resolves this mapping, and is monotonic thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub conversation_id: ConversationId,
    pub thread_id: ThreadId,
    /// Base name of the workspace folder this daemon serves.
    pub workspace: String,
    /// Millis since epoch.
    pub created_at: i64,
    /// Millis since epoch; `None` until the mapping is claimed.
    pub claimed_at: Option<i64>,
}

impl Mapping {
    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }
}

/// Which resolve strategy produced a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMethod {
    LatestUnclaimed,
    WaitedForNew,
}

/// Current millis since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
