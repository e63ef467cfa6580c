//! Error types for warden-core
//!
//! One taxonomy for the whole control plane, plus the short natural-language
//! notices shown to users when a turn or provisioning step fails.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Port range exhausted during sandbox provisioning
    #[error("no available ports in range {start}-{end}")]
    NoPortAvailable {
        /// Start of the scanned range
        start: u16,
        /// End of the scanned range
        end: u16,
    },

    /// Device key material is corrupt or unusable
    #[error("device key error: {0}")]
    Key(String),

    /// Gateway handshake did not complete within the deadline
    #[error("gateway connection timed out")]
    ConnectionTimeout,

    /// Pairing-recovery retries exhausted
    #[error("gateway connection failed after {attempts} attempts")]
    ConnectionExhausted {
        /// Number of handshake attempts made
        attempts: u32,
    },

    /// Gateway rejected the connect request (non-pairing failure)
    #[error("gateway authentication failed: {0}")]
    GatewayAuth(String),

    /// No terminal chat event arrived within the turn deadline
    #[error("turn timed out")]
    TurnTimeout,

    /// Gateway rejected or aborted an in-flight turn
    #[error("turn rejected: {0}")]
    TurnRejected(String),

    /// Per-user backlog is at capacity
    #[error("too many queued turns")]
    QueueFull,

    /// External credential provisioning failed (non-fatal to provisioning)
    #[error("credential provisioning failed: {0}")]
    Credential(String),

    /// Container runtime failure or control port never became reachable
    #[error("container unavailable: {0}")]
    ContainerUnavailable(String),

    /// Persistence error
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Internal error (serialization, channel plumbing)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short user-facing notice for this failure.
    ///
    /// Users never see protocol details or stack traces; every failure maps
    /// to one plain sentence.
    pub fn user_notice(&self) -> String {
        match self {
            Error::NoPortAvailable { .. } | Error::ContainerUnavailable(_) => {
                "Your environment could not be started. Please try again later.".to_string()
            }
            Error::Key(_)
            | Error::ConnectionTimeout
            | Error::ConnectionExhausted { .. }
            | Error::GatewayAuth(_) => {
                "I couldn't reach your environment. Please try again in a moment.".to_string()
            }
            Error::TurnTimeout => {
                "That took too long and I gave up waiting. Please try again.".to_string()
            }
            Error::TurnRejected(msg) => {
                format!("Sorry, I encountered an error: {}", msg)
            }
            Error::QueueFull => {
                "You have too many messages queued. Please wait for a response.".to_string()
            }
            Error::Credential(_) => {
                "Part of your environment is temporarily unavailable.".to_string()
            }
            Error::Store(_) | Error::Internal(_) => {
                "Sorry, something went wrong. Please try again.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_are_short_and_free_of_detail() {
        let errors = [
            Error::NoPortAvailable {
                start: 30000,
                end: 35000,
            },
            Error::ConnectionTimeout,
            Error::TurnTimeout,
            Error::QueueFull,
            Error::Internal("oneshot closed".to_string()),
        ];
        for err in errors {
            let notice = err.user_notice();
            assert!(!notice.is_empty());
            assert!(notice.len() < 120);
            assert!(!notice.contains("oneshot"));
        }
    }

    #[test]
    fn rejected_turn_carries_gateway_message() {
        let err = Error::TurnRejected("session busy".to_string());
        assert!(err.user_notice().contains("session busy"));
    }
}
