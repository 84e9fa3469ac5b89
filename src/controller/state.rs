//! Session lifecycle states and the bookkeeping shared with stop handles.

use std::fmt;
use std::path::PathBuf;

use crate::codec::FrameMetadata;

/// Lifecycle of a controller session.
///
/// ```text
/// Uninitialized ─start→ Starting ─handshake→ Ready ⇄ Stepping
///        any ─stop→ Stopped ─start→ Starting
///   Stepping ─fatal error→ Failed ─stop→ Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No simulator has been started yet.
    Uninitialized,
    /// Launching the process and waiting for the handshake frame.
    Starting,
    /// Idle with a live simulator.
    Ready,
    /// One action in flight.
    Stepping,
    /// A transport or protocol error made the session unusable; call `stop()`.
    Failed,
    /// Explicitly stopped; may be started again.
    Stopped,
}

impl SessionState {
    /// Returns `true` if `start()` is allowed from this state.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Stopped)
    }

    /// Returns `true` while a simulator process is expected to be alive.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stepping)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stepping => "stepping",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Observable session bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct Status {
    pub(crate) state: SessionState,
    pub(crate) session_id: Option<String>,
    pub(crate) socket_path: Option<PathBuf>,
    pub(crate) pid: Option<u32>,
    pub(crate) last_sequence: Option<u64>,
    pub(crate) step_count: u64,
    pub(crate) metadata: Option<FrameMetadata>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: SessionState::Uninitialized,
            session_id: None,
            socket_path: None,
            pid: None,
            last_sequence: None,
            step_count: 0,
            metadata: None,
        }
    }
}

impl Status {
    /// Clears per-session fields for a fresh start.
    pub(crate) fn begin_start(&mut self) {
        *self = Self {
            state: SessionState::Starting,
            ..Self::default()
        };
    }
}
