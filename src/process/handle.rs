//! Shared handle to one launched simulator process.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;

/// Liveness of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Still running.
    Running,
    /// Exited on its own with this code.
    Exited(i32),
    /// Terminated by this signal (including the supervisor's own SIGTERM/SIGKILL).
    Crashed(i32),
}

impl ProcessStatus {
    /// Returns `true` for [`ProcessStatus::Running`].
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    pub(crate) fn from_exit(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Crashed(signal),
            (None, None) => Self::Exited(-1),
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Crashed(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Handle to a launched process.
///
/// Cheap to clone; every clone refers to the same child. The child is owned
/// by the handle, so its pid cannot be recycled until the handle reaps it.
/// When the last clone is dropped a still-running child is killed.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pid: u32,
    binary: PathBuf,
    child: Mutex<Child>,
    exit: Mutex<Option<ProcessStatus>>,
    cleanup: Mutex<Vec<PathBuf>>,
}

impl ProcessHandle {
    pub(crate) fn new(child: Child, binary: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                pid: child.id(),
                binary,
                child: Mutex::new(child),
                exit: Mutex::new(None),
                cleanup: Mutex::new(Vec::new()),
            }),
        }
    }

    /// OS process id (also the process group id).
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Executable that was launched.
    pub fn binary(&self) -> &Path {
        &self.inner.binary
    }

    /// Registers a file to delete when the process is stopped.
    pub fn register_cleanup(&self, path: impl Into<PathBuf>) {
        self.inner
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.into());
    }

    /// Exit status recorded so far, `None` while still running.
    pub fn cached_exit(&self) -> Option<ProcessStatus> {
        *self.inner.exit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking status check; reaps the child if it has exited.
    pub(crate) fn try_status(&self) -> Result<ProcessStatus> {
        if let Some(status) = self.cached_exit() {
            return Ok(status);
        }
        let polled = self
            .inner
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait()?;
        Ok(match polled {
            Some(exit) => self.record(ProcessStatus::from_exit(exit)),
            None => ProcessStatus::Running,
        })
    }

    /// Blocks until the child exits.
    pub(crate) fn wait(&self) -> Result<ProcessStatus> {
        if let Some(status) = self.cached_exit() {
            return Ok(status);
        }
        let exit = self
            .inner
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .wait()?;
        Ok(self.record(ProcessStatus::from_exit(exit)))
    }

    fn record(&self, status: ProcessStatus) -> ProcessStatus {
        let mut exit = self.inner.exit.lock().unwrap_or_else(PoisonError::into_inner);
        *exit.get_or_insert(status)
    }

    /// Removes every registered cleanup path. Missing files are fine.
    pub(crate) fn run_cleanup(&self) {
        let paths = std::mem::take(
            &mut *self.inner.cleanup.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("[supervisor] removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("[supervisor] failed to remove {}: {e}", path.display()),
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        let exited = self.exit.get_mut().unwrap_or_else(PoisonError::into_inner).is_some();
        if !exited && matches!(child.try_wait(), Ok(None)) {
            log::warn!("[supervisor] handle dropped with pid {} still running, killing", self.pid);
            super::send_signal(self.pid, libc::SIGKILL);
            let _ = child.wait();
        }
        for path in self.cleanup.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessStatus::Running.to_string(), "running");
        assert_eq!(ProcessStatus::Exited(3).to_string(), "exited with code 3");
        assert_eq!(ProcessStatus::Crashed(9).to_string(), "killed by signal 9");
    }

    #[test]
    fn test_clones_share_exit_status() {
        let child = Command::new("/bin/sh").args(["-c", "exit 4"]).spawn().unwrap();
        let a = ProcessHandle::new(child, PathBuf::from("/bin/sh"));
        let b = a.clone();
        assert_eq!(a.wait().unwrap(), ProcessStatus::Exited(4));
        assert_eq!(b.cached_exit(), Some(ProcessStatus::Exited(4)));
        assert_eq!(b.try_status().unwrap(), ProcessStatus::Exited(4));
    }

    #[test]
    fn test_cleanup_removes_registered_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("leftover.sock");
        std::fs::write(&file, b"").unwrap();

        let child = Command::new("/bin/sh").args(["-c", "exit 0"]).spawn().unwrap();
        let handle = ProcessHandle::new(child, PathBuf::from("/bin/sh"));
        handle.register_cleanup(&file);
        handle.register_cleanup(tmp.path().join("never-created"));
        handle.run_cleanup();
        assert!(!file.exists());
        handle.wait().unwrap();
    }
}
