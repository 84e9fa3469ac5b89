//! Error taxonomy for the simulator bridge.
//!
//! Every public operation returns [`BridgeError`]. The variants split into
//! three families:
//!
//! - **Caller errors** ([`BridgeError::InvalidAction`], [`BridgeError::SessionBusy`]):
//!   no I/O was performed, the session is untouched and the call can be retried
//!   with corrected input or after the in-flight step returns.
//! - **Lifecycle errors** ([`BridgeError::ProcessStartup`],
//!   [`BridgeError::ProcessStopped`], [`BridgeError::SimulatorNotRunning`]):
//!   the simulator process is gone or never came up; recover with
//!   `stop()` followed by a fresh `start()`.
//! - **Protocol errors** ([`BridgeError::TransportTimeout`],
//!   [`BridgeError::MalformedFrame`], [`BridgeError::SequenceDesync`]): the
//!   channel can no longer be trusted. Never retried automatically, since the
//!   simulator may already have applied the action.

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the controller, transport, codec and supervisor.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Local validation rejected an action before anything was sent.
    #[error("invalid action '{action_name}': {}", .problems.join("; "))]
    InvalidAction {
        /// Wire name of the rejected action.
        action_name: String,
        /// One entry per missing, unknown or out-of-range parameter.
        problems: Vec<String>,
    },

    /// The simulator could not be launched or never completed its handshake.
    #[error("simulator failed to start: {0}")]
    ProcessStartup(String),

    /// The simulator process stopped (or was stopped) while a call was pending.
    #[error("simulator process stopped: {0}")]
    ProcessStopped(String),

    /// The session has no live simulator to talk to.
    #[error("simulator is not running: {0}")]
    SimulatorNotRunning(String),

    /// No complete reply arrived within the configured timeout.
    #[error("timed out after {0:?} waiting for the simulator")]
    TransportTimeout(Duration),

    /// Bytes on the wire did not match their declared layout.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame arrived with an unexpected sequence counter.
    #[error("sequence desync: expected frame {expected}, received {received}")]
    SequenceDesync {
        /// Sequence counter the controller was waiting for.
        expected: u64,
        /// Sequence counter carried by the received frame.
        received: u64,
    },

    /// Another step is already in flight on this session.
    #[error("session busy: another step is in flight")]
    SessionBusy,

    /// The binary-fetch collaborator could not provide a simulator build.
    #[error("simulator binary unavailable: {0:#}")]
    Fetch(anyhow::Error),

    /// Configuration could not be loaded or saved.
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    /// Unclassified OS-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Builds a [`BridgeError::InvalidAction`] from a single problem.
    pub(crate) fn invalid(action_name: &str, problem: impl Into<String>) -> Self {
        Self::InvalidAction {
            action_name: action_name.to_string(),
            problems: vec![problem.into()],
        }
    }

    /// Builds a [`BridgeError::MalformedFrame`] from anything displayable.
    pub(crate) fn malformed(detail: impl std::fmt::Display) -> Self {
        Self::MalformedFrame(detail.to_string())
    }

    /// Returns `true` if this error leaves the session unusable.
    ///
    /// Validation and busy errors are the only recoverable ones: they are
    /// raised before the transport is touched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidAction { .. } | Self::SessionBusy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_action_message_lists_all_problems() {
        let err = BridgeError::InvalidAction {
            action_name: "MoveArm".to_string(),
            problems: vec![
                "missing required parameter 'position'".to_string(),
                "unknown parameter 'foo'".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("MoveArm"), "{msg}");
        assert!(msg.contains("'position'"), "{msg}");
        assert!(msg.contains("'foo'"), "{msg}");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!BridgeError::SessionBusy.is_fatal());
        assert!(!BridgeError::invalid("Pass", "nope").is_fatal());
        assert!(BridgeError::TransportTimeout(Duration::from_secs(1)).is_fatal());
        assert!(BridgeError::malformed("short header").is_fatal());
        assert!(BridgeError::SequenceDesync { expected: 2, received: 7 }.is_fatal());
        assert!(BridgeError::ProcessStopped("killed".into()).is_fatal());
    }

    #[test]
    fn test_desync_message() {
        let err = BridgeError::SequenceDesync { expected: 3, received: 9 };
        assert_eq!(
            err.to_string(),
            "sequence desync: expected frame 3, received 9"
        );
    }
}
