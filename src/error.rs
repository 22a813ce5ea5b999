//! Error types shared across the daemon.

/// Crate-wide result alias.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Domain errors the control plane distinguishes.
///
/// Watcher loops log these and continue on the next tick; RPC handlers
/// translate them into `{success:false, error}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No live gateway session. Not retried inline.
    #[error("not connected to Discord")]
    NotConnected,

    /// RPC preflight failure; maps to HTTP 400.
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// A thread, channel, guild, or message id is no longer valid.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bot lacks one or more required permissions.
    #[error("missing permissions: {0}")]
    PermissionDenied(String),

    /// Rate limited and retries exhausted.
    #[error("rate limited by the chat service")]
    Throttled,

    /// The IDE state database is busy; abandon the current tick.
    #[error("IDE state database is locked")]
    Locked,

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("timed out")]
    Timeout,

    /// Keystroke injection was refused by the OS.
    #[error("accessibility permission denied: {0}")]
    AccessibilityDenied(String),

    /// Recorded, never fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Gateway protocol failure (handshake, close codes, serialization).
    #[error("gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("state store error: {0}")]
    Store(#[from] redb::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// True for errors that should flag a mapping as stale rather than
    /// propagate (the backing thread is gone).
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound(_))
    }

    /// HTTP status for the RPC surface: domain errors stay 200 with a
    /// `success:false` body, preflight failures are 400, and unexpected
    /// faults (wrapped infrastructure errors) are 500.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::MissingParameter(_) => 400,
            BridgeError::Http(_)
            | BridgeError::Store(_)
            | BridgeError::Sqlx(_)
            | BridgeError::Io(_)
            | BridgeError::Json(_)
            | BridgeError::Other(_) => 500,
            _ => 200,
        }
    }
}

macro_rules! from_redb {
    ($($err:ty),+ $(,)?) => {
        $(impl From<$err> for BridgeError {
            fn from(error: $err) -> Self {
                BridgeError::Store(redb::Error::from(error))
            }
        })+
    };
}

from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tiers() {
        assert_eq!(BridgeError::MissingParameter("threadId").http_status(), 400);
        assert_eq!(BridgeError::NotConnected.http_status(), 200);
        assert_eq!(BridgeError::Throttled.http_status(), 200);
        assert_eq!(BridgeError::Timeout.http_status(), 200);

        let io = BridgeError::Io(std::io::Error::other("disk fell off"));
        assert_eq!(io.http_status(), 500);
        let json = BridgeError::Json(serde_json::from_str::<i64>("[").unwrap_err());
        assert_eq!(json.http_status(), 500);
        let other = BridgeError::Other(anyhow::anyhow!("unexpected"));
        assert_eq!(other.http_status(), 500);
    }

    #[test]
    fn not_found_flags_stale() {
        assert!(BridgeError::NotFound("thread 1".into()).is_not_found());
        assert!(!BridgeError::Throttled.is_not_found());
    }
}
