//! Controller: one explicit session with one simulator process.
//!
//! A [`Controller`] owns everything about its session: the process handle,
//! the transport and the sequence counter. Nothing is process-global, so
//! independent controllers run side by side without coordination.
//!
//! # Step protocol
//!
//! `step(action)` validates locally, requires `Ready`, polls the process,
//! sends the action, and blocks for exactly one frame. The frame must carry
//! the next sequence number (or 0 after a successful `Reset`). A frame with
//! `success == false` is a normal result and leaves the session `Ready`.
//! Transport and protocol errors move the session to `Failed`; the caller
//! must `stop()` and `start()` again. Nothing is retried.
//!
//! # Concurrency
//!
//! All I/O goes through one `Mutex`; a second concurrent `step()` fails
//! immediately with [`BridgeError::SessionBusy`] instead of queueing.
//! [`Controller::stop`] and [`StopHandle::stop`] never wait for that lock:
//! they interrupt the blocked call, which then fails with
//! [`BridgeError::ProcessStopped`].

mod session;
mod state;

pub use state::SessionState;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::action::Action;
use crate::codec::{AgentPose, Frame, FrameMetadata};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::fetch::{BinaryFetcher, Platform};
use crate::process::{ProcessHandle, ProcessStatus, ProcessSupervisor};
use crate::transport::Interrupter;

use session::Session;
use state::Status;

/// State reachable from both the controller and its stop handles.
#[derive(Debug)]
struct Shared {
    status: Mutex<Status>,
    process: Mutex<Option<ProcessHandle>>,
    interrupter: Interrupter,
    supervisor: ProcessSupervisor,
    grace_period: Duration,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self) -> MutexGuard<'_, Option<ProcessHandle>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interrupts any blocked call, stops the process and marks the session
    /// stopped.
    fn stop(&self) -> Result<()> {
        self.interrupter.interrupt();
        let process = self.process().take();
        let result = match &process {
            Some(handle) => self.supervisor.stop(handle, self.grace_period).map(|_| ()),
            None => Ok(()),
        };

        let mut status = self.status();
        if status.state != SessionState::Stopped {
            log::info!(
                "[session] {} stopped (was {})",
                status.session_id.as_deref().unwrap_or("-"),
                status.state
            );
        }
        status.state = SessionState::Stopped;
        status.pid = None;
        result
    }

    /// Records a fatal error for the in-flight step.
    fn fail(&self, err: &BridgeError) {
        let mut status = self.status();
        if matches!(status.state, SessionState::Ready | SessionState::Stepping) {
            status.state = if self.interrupter.is_interrupted() {
                SessionState::Stopped
            } else {
                SessionState::Failed
            };
            log::error!(
                "[session] {} {}: {err}",
                status.session_id.as_deref().unwrap_or("-"),
                status.state
            );
        }
    }
}

/// Stops a controller's session from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Same as [`Controller::stop`], without waiting for an in-flight step.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the process could not be reaped; the
    /// session is marked stopped regardless.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop()
    }
}

/// Host-side controller for one simulator session.
#[derive(Debug)]
pub struct Controller {
    config: BridgeConfig,
    shared: Arc<Shared>,
    io: Mutex<Option<Session>>,
}

impl Controller {
    /// Creates an idle controller.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if `config` is unusable.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            status: Mutex::new(Status::default()),
            process: Mutex::new(None),
            interrupter: Interrupter::new(),
            supervisor: ProcessSupervisor::new(),
            grace_period: config.stop_grace_period(),
        });
        Ok(Self {
            config,
            shared,
            io: Mutex::new(None),
        })
    }

    /// Configuration this controller was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn lock_io(&self) -> Result<MutexGuard<'_, Option<Session>>> {
        match self.io.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(BridgeError::SessionBusy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Fetches the binary, launches the simulator and waits for its
    /// handshake frame (sequence 0).
    ///
    /// Allowed from `Uninitialized` and `Stopped`. On failure the process is
    /// stopped and the session ends `Stopped`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Fetch`] if no binary is available
    /// - [`BridgeError::ProcessStartup`] if the simulator cannot be launched,
    ///   exits, or does not connect and hand shake within the startup timeout
    /// - [`BridgeError::ProcessStopped`] if stopped meanwhile
    /// - [`BridgeError::SessionBusy`] if another call holds the session
    pub fn start(&self, fetcher: &dyn BinaryFetcher) -> Result<Frame> {
        let mut io = self.lock_io()?;
        {
            let mut status = self.shared.status();
            if !status.state.can_start() {
                return Err(BridgeError::ProcessStartup(format!(
                    "cannot start a session that is {}",
                    status.state
                )));
            }
            status.begin_start();
            self.shared.interrupter.reset();
        }
        // Previous generation's socket goes away before the new one binds.
        io.take();

        match self.start_session(fetcher) {
            Ok((session, frame)) => {
                let mut status = self.shared.status();
                if status.state != SessionState::Starting || self.shared.interrupter.is_interrupted() {
                    drop(status);
                    drop(session);
                    let _ = self.shared.stop();
                    return Err(BridgeError::ProcessStopped(
                        "stopped during startup".to_string(),
                    ));
                }
                status.state = SessionState::Ready;
                status.last_sequence = Some(frame.sequence);
                status.metadata = Some(frame.metadata.clone());
                status.session_id = Some(session.id().to_string());
                status.socket_path = Some(session.socket_path().to_path_buf());
                status.pid = Some(session.process().pid());
                log::info!(
                    "[session] {} ready (pid {}, socket {})",
                    session.id(),
                    session.process().pid(),
                    session.socket_path().display()
                );
                *io = Some(session);
                Ok(frame)
            }
            Err(e) => {
                log::error!("[session] startup failed: {e}");
                if let Err(stop_err) = self.shared.stop() {
                    log::warn!("[session] cleanup after failed start: {stop_err}");
                }
                Err(e)
            }
        }
    }

    fn start_session(&self, fetcher: &dyn BinaryFetcher) -> Result<(Session, Frame)> {
        let platform = Platform::current();
        let binary = fetcher
            .fetch(platform, &self.config.build_version)
            .map_err(BridgeError::Fetch)?;
        let deadline = Instant::now() + self.config.startup_timeout();

        let mut session = Session::launch(
            &self.config,
            binary,
            &self.shared.interrupter,
            &self.shared.supervisor,
        )?;
        *self.shared.process() = Some(session.process().clone());
        if self.shared.interrupter.is_interrupted() {
            return Err(BridgeError::ProcessStopped("stopped during startup".to_string()));
        }

        let frame = session.connect(&self.config, &self.shared.supervisor, deadline)?;
        Ok((session, frame))
    }

    /// Sends one action and returns the frame that answers it.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::InvalidAction`] before any I/O; session unchanged
    /// - [`BridgeError::SessionBusy`] if another step is in flight; unchanged
    /// - [`BridgeError::SimulatorNotRunning`] if the session is not `Ready`
    ///   or the process has died
    /// - [`BridgeError::TransportTimeout`], [`BridgeError::MalformedFrame`],
    ///   [`BridgeError::SequenceDesync`], [`BridgeError::ProcessStopped`]:
    ///   the session becomes `Failed` (or `Stopped` if it was stopped)
    pub fn step(&self, action: &Action) -> Result<Frame> {
        action.validate()?;
        let mut io = self.lock_io()?;

        let last_sequence = {
            let mut status = self.shared.status();
            if status.state != SessionState::Ready {
                return Err(BridgeError::SimulatorNotRunning(format!(
                    "session is {}",
                    status.state
                )));
            }
            status.state = SessionState::Stepping;
            status.last_sequence
        };

        let Some(session) = io.as_mut() else {
            let err = BridgeError::SimulatorNotRunning("no session".to_string());
            self.shared.fail(&err);
            return Err(err);
        };

        match self.shared.supervisor.poll(session.process()) {
            Ok(ProcessStatus::Running) => {}
            Ok(exit) => {
                let err = BridgeError::SimulatorNotRunning(format!("simulator {exit}"));
                self.shared.fail(&err);
                return Err(err);
            }
            Err(e) => {
                self.shared.fail(&e);
                return Err(e);
            }
        }

        let result = session
            .round_trip(action, self.config.step_timeout())
            .and_then(|frame| {
                let expected = expected_sequence(last_sequence, action, &frame);
                if frame.sequence == expected {
                    Ok(frame)
                } else {
                    Err(BridgeError::SequenceDesync {
                        expected,
                        received: frame.sequence,
                    })
                }
            });

        match result {
            Ok(frame) => {
                let mut status = self.shared.status();
                status.last_sequence = Some(frame.sequence);
                status.step_count += 1;
                status.metadata = Some(frame.metadata.clone());
                if status.state == SessionState::Stepping {
                    status.state = SessionState::Ready;
                }
                if !frame.success {
                    log::debug!("[session] {} failed in simulator: {}", action.name(), frame.error);
                }
                Ok(frame)
            }
            Err(e) => {
                self.shared.fail(&e);
                Err(e)
            }
        }
    }

    /// Loads `scene`; a successful reply restarts the sequence at 0.
    ///
    /// # Errors
    ///
    /// Same as [`Controller::step`].
    pub fn reset(&self, scene: &str) -> Result<Frame> {
        self.step(&Action::reset(scene))
    }

    /// Stops the simulator and ends the session. Valid from any state;
    /// stopping a stopped session does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the process could not be reaped; the
    /// session is marked stopped regardless.
    pub fn stop(&self) -> Result<()> {
        let result = self.shared.stop();
        // A step blocked on another thread still holds the session; it
        // releases it when its interrupted receive returns.
        if let Ok(mut io) = self.io.try_lock() {
            io.take();
        }
        result
    }

    /// Handle for stopping this session from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.status().state
    }

    /// Sequence number of the last accepted frame.
    pub fn last_sequence(&self) -> Option<u64> {
        self.shared.status().last_sequence
    }

    /// Number of completed steps since `start()` (resets included).
    pub fn step_count(&self) -> u64 {
        self.shared.status().step_count
    }

    /// Metadata of the last accepted frame.
    pub fn last_metadata(&self) -> Option<FrameMetadata> {
        self.shared.status().metadata.clone()
    }

    /// Agent pose from the last accepted frame.
    pub fn agent_pose(&self) -> Option<AgentPose> {
        self.shared.status().metadata.as_ref().map(|m| m.agent.clone())
    }

    /// Session identifier, once started.
    pub fn session_id(&self) -> Option<String> {
        self.shared.status().session_id.clone()
    }

    /// Socket the simulator is connected to, once started.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.shared.status().socket_path.clone()
    }

    /// Simulator pid while a process is attached.
    pub fn pid(&self) -> Option<u32> {
        self.shared.status().pid
    }

    /// Current status of the attached process, `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the OS refuses to report the status.
    pub fn process_status(&self) -> Result<Option<ProcessStatus>> {
        let process = self.shared.process().clone();
        process
            .map(|handle| self.shared.supervisor.poll(&handle))
            .transpose()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let state = self.state();
        if state.is_live() || state == SessionState::Failed {
            if let Err(e) = self.stop() {
                log::warn!("[session] stop on drop failed: {e}");
            }
        }
    }
}

/// Sequence number the next frame must carry.
fn expected_sequence(last: Option<u64>, action: &Action, frame: &Frame) -> u64 {
    if action.is_reset() && frame.success {
        0
    } else {
        last.map_or(0, |s| s + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn frame(sequence: u64, success: bool) -> Frame {
        Frame {
            sequence,
            success,
            error: String::new(),
            images: BTreeMap::new(),
            metadata: FrameMetadata::default(),
        }
    }

    #[test]
    fn test_expected_sequence_increments() {
        assert_eq!(expected_sequence(Some(4), &Action::Pass, &frame(5, true)), 5);
        assert_eq!(expected_sequence(Some(4), &Action::Pass, &frame(5, false)), 5);
    }

    #[test]
    fn test_successful_reset_restarts_at_zero() {
        assert_eq!(expected_sequence(Some(12), &Action::reset("A"), &frame(0, true)), 0);
        // A rejected reset is an ordinary step.
        assert_eq!(expected_sequence(Some(12), &Action::reset("A"), &frame(13, false)), 13);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = BridgeConfig {
            width: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(Controller::new(config), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_step_before_start_is_not_running() {
        let controller = Controller::new(BridgeConfig::default()).unwrap();
        let err = controller.step(&Action::Pass).unwrap_err();
        assert!(matches!(err, BridgeError::SimulatorNotRunning(_)), "{err:?}");
        assert_eq!(controller.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_invalid_action_rejected_before_state_check() {
        let controller = Controller::new(BridgeConfig::default()).unwrap();
        let err = controller
            .step(&Action::SetHandSphereRadius { radius: 3.0 })
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAction { .. }), "{err:?}");
    }

    #[test]
    fn test_stop_is_valid_from_any_state() {
        let controller = Controller::new(BridgeConfig::default()).unwrap();
        controller.stop().unwrap();
        assert_eq!(controller.state(), SessionState::Stopped);
        controller.stop().unwrap();
        assert_eq!(controller.state(), SessionState::Stopped);
        assert!(controller.process_status().unwrap().is_none());
    }

    #[test]
    fn test_start_with_missing_binary_ends_stopped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = BridgeConfig {
            socket_dir: tmp.path().to_path_buf(),
            ..BridgeConfig::default()
        };
        let controller = Controller::new(config).unwrap();
        let err = controller
            .start(&crate::fetch::LocalBinary::new(tmp.path().join("absent")))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Fetch(_)), "{err:?}");
        assert_eq!(controller.state(), SessionState::Stopped);
    }
}
