//! Launching, polling and stopping the external simulator process.
//!
//! The child runs in its own process group so that helper processes it
//! spawns are signalled together with it. Stopping is graceful first:
//! SIGTERM to the group, a bounded wait, then SIGKILL.
//!
//! # Platform Support
//!
//! Unix only (process groups and signals via `libc`).

mod handle;

pub use handle::{ProcessHandle, ProcessStatus};

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::EXIT_POLL_INTERVAL;
use crate::error::{BridgeError, Result};

/// Sends `signal` to the process group led by `pid`, falling back to the
/// process itself if the group is gone. Returns `true` if delivered.
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The pid belongs
    // to a child we have not reaped yet, so it cannot have been recycled.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}

/// Returns `true` if any process in the group led by `pid` is still alive.
fn group_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only probes for existence.
    unsafe { libc::kill(-pid, 0) == 0 }
}

/// Launches and terminates simulator processes.
///
/// Stateless: everything about a running process lives in its
/// [`ProcessHandle`], so one supervisor can serve any number of sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Creates a supervisor.
    pub fn new() -> Self {
        Self
    }

    /// Launches `binary` with `args` in a new process group.
    ///
    /// Stdin is closed; stdout and stderr are inherited.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ProcessStartup`] if the executable cannot be
    /// spawned.
    pub fn start(
        &self,
        binary: &Path,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> Result<ProcessHandle> {
        let mut command = Command::new(binary);
        command.args(args).stdin(Stdio::null()).process_group(0);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            BridgeError::ProcessStartup(format!("failed to launch {}: {e}", binary.display()))
        })?;
        let handle = ProcessHandle::new(child, binary.to_path_buf());
        log::info!(
            "[supervisor] launched {} (pid {})",
            binary.display(),
            handle.pid()
        );
        log::debug!("[supervisor] args: {args:?}");
        Ok(handle)
    }

    /// Reports whether the process is running, exited or was killed.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the OS refuses to report the status.
    pub fn poll(&self, handle: &ProcessHandle) -> Result<ProcessStatus> {
        handle.try_status()
    }

    /// Stops the process: SIGTERM, wait up to `grace_period`, then SIGKILL.
    ///
    /// Safe to call from any thread and more than once; a process that
    /// already exited is only reaped. Registered cleanup files are removed
    /// in every case.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if waiting on the child fails.
    pub fn stop(&self, handle: &ProcessHandle, grace_period: Duration) -> Result<ProcessStatus> {
        let pid = handle.pid();
        let mut status = handle.try_status()?;

        if status.is_running() {
            log::info!("[supervisor] stopping pid {pid} (SIGTERM, grace {grace_period:?})");
            send_signal(pid, libc::SIGTERM);

            let deadline = Instant::now() + grace_period;
            loop {
                status = handle.try_status()?;
                if !status.is_running() || Instant::now() >= deadline {
                    break;
                }
                thread::sleep(EXIT_POLL_INTERVAL);
            }

            if status.is_running() {
                log::warn!("[supervisor] pid {pid} ignored SIGTERM, sending SIGKILL");
                send_signal(pid, libc::SIGKILL);
                status = handle.wait()?;
            }
        }

        // Helpers left behind in the group.
        if group_alive(pid) {
            log::debug!("[supervisor] killing leftover processes in group {pid}");
            send_signal(pid, libc::SIGKILL);
        }

        handle.run_cleanup();
        log::info!("[supervisor] pid {pid} {status}");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessHandle {
        ProcessSupervisor::new()
            .start(Path::new("/bin/sh"), &["-c".to_string(), script.to_string()], None)
            .unwrap()
    }

    fn wait_until_exit(handle: &ProcessHandle) -> ProcessStatus {
        let supervisor = ProcessSupervisor::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = supervisor.poll(handle).unwrap();
            if !status.is_running() || Instant::now() > deadline {
                return status;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_poll_reports_exit_code() {
        let handle = sh("exit 3");
        assert_eq!(wait_until_exit(&handle), ProcessStatus::Exited(3));
    }

    #[test]
    fn test_poll_reports_crash_signal() {
        let handle = sh("kill -USR1 $$");
        assert_eq!(wait_until_exit(&handle), ProcessStatus::Crashed(libc::SIGUSR1));
    }

    #[test]
    fn test_start_missing_binary_is_startup_error() {
        let err = ProcessSupervisor::new()
            .start(Path::new("/nonexistent/simulator"), &[], None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::ProcessStartup(_)), "{err:?}");
    }

    #[test]
    fn test_start_uses_working_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let handle = ProcessSupervisor::new()
            .start(
                Path::new("/bin/sh"),
                &["-c".to_string(), "touch here".to_string()],
                Some(tmp.path()),
            )
            .unwrap();
        assert_eq!(wait_until_exit(&handle), ProcessStatus::Exited(0));
        assert!(tmp.path().join("here").exists());
    }

    #[test]
    fn test_stop_terminates_gracefully() {
        let handle = sh("sleep 30");
        let started = Instant::now();
        let status = ProcessSupervisor::new()
            .stop(&handle, Duration::from_secs(5))
            .unwrap();
        assert_eq!(status, ProcessStatus::Crashed(libc::SIGTERM));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        let handle = sh("trap '' TERM; while :; do sleep 0.05; done");
        // Give the shell time to install the trap.
        thread::sleep(Duration::from_millis(200));
        let status = ProcessSupervisor::new()
            .stop(&handle, Duration::from_millis(300))
            .unwrap();
        assert_eq!(status, ProcessStatus::Crashed(libc::SIGKILL));
    }

    #[test]
    fn test_stop_is_idempotent_and_cleans_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("sim.sock");
        std::fs::write(&file, b"").unwrap();

        let handle = sh("sleep 30");
        handle.register_cleanup(&file);
        let supervisor = ProcessSupervisor::new();
        let first = supervisor.stop(&handle, Duration::from_secs(2)).unwrap();
        let second = supervisor.stop(&handle, Duration::from_secs(2)).unwrap();
        assert_eq!(first, second);
        assert!(!file.exists());
        assert!(!supervisor.poll(&handle).unwrap().is_running());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stop_reaches_process_group() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pid_file = tmp.path().join("helper.pid");
        let script = format!(
            "sleep 30 & echo $! > {}; wait",
            pid_file.display()
        );
        let handle = sh(&script);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pid_file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));
        let helper: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        ProcessSupervisor::new()
            .stop(&handle, Duration::from_secs(2))
            .unwrap();

        // The helper is not our child: it is reparented, and may linger as a
        // zombie if nothing reaps it. Either way it must stop running.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut alive = true;
        while alive && Instant::now() < deadline {
            alive = match std::fs::read_to_string(format!("/proc/{helper}/stat")) {
                Ok(stat) => !stat.rsplit(')').next().unwrap_or("").trim_start().starts_with('Z'),
                Err(_) => false,
            };
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!alive, "helper {helper} survived the group stop");
    }
}
