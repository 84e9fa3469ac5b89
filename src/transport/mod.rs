//! Single-client Unix socket channel between controller and simulator.
//!
//! The controller binds a socket under a private directory, launches the
//! simulator with the socket path on its command line, and waits for it to
//! connect. Launch and connect are not atomic, so [`TransportChannel::accept_connection`]
//! polls with doubling backoff up to the startup budget.
//!
//! Exactly one simulator connection is served. Anyone else who connects
//! while the session is active is accepted only to be shut down again,
//! both before a send and while a receive is waiting. On Linux the
//! channel can also be restricted to peers in the simulator's process
//! group ([`TransportChannel::restrict_peer_group`]).
//!
//! All calls block the calling thread. [`Interrupter`] lets another thread
//! abort a blocked call, which then fails with
//! [`BridgeError::ProcessStopped`].

mod interrupt;

pub use interrupt::Interrupter;

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{Envelope, EnvelopeDecoder};
use crate::constants::{MAX_SOCKET_PATH, READ_BUFFER_SIZE, READ_SLICE};
use crate::error::{BridgeError, Result};

/// Builds `{dir}/sim-{token}.sock`, validated against the kernel path limit.
///
/// # Errors
///
/// Returns [`BridgeError::ProcessStartup`] if the path is too long.
pub fn socket_path_in(dir: &Path, token: &str) -> Result<PathBuf> {
    let path = dir.join(format!("sim-{token}.sock"));
    check_path_len(&path)?;
    Ok(path)
}

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        return Err(BridgeError::ProcessStartup(format!(
            "socket path too long ({len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            path.display()
        )));
    }
    Ok(())
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

/// Listening endpoint plus the one accepted simulator connection.
#[derive(Debug)]
pub struct TransportChannel {
    path: PathBuf,
    listener: UnixListener,
    stream: Option<UnixStream>,
    decoder: EnvelopeDecoder,
    pending: VecDeque<Envelope>,
    interrupter: Interrupter,
    peer_group: Option<u32>,
}

impl TransportChannel {
    /// Binds the listening socket.
    ///
    /// Removes any stale socket file, creates the parent directory, binds,
    /// and restricts the socket to its owner (0600).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ProcessStartup`] if the path is too long or
    /// the socket cannot be bound.
    pub fn bind(path: PathBuf, interrupter: Interrupter) -> Result<Self> {
        check_path_len(&path)?;

        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            BridgeError::ProcessStartup(format!("bind socket {}: {e}", path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        log::debug!("[transport] listening on {}", path.display());

        Ok(Self {
            path,
            listener,
            stream: None,
            decoder: EnvelopeDecoder::new(),
            pending: VecDeque::new(),
            interrupter,
            peer_group: None,
        })
    }

    /// Path of the listening socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` once the shared interrupter has fired.
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupter.is_interrupted()
    }

    /// Only accept a connection from a process in group `pgid`.
    ///
    /// The simulator is spawned as its own group leader, so its pid is the
    /// group id. Ignored where peer credentials are unavailable.
    pub fn restrict_peer_group(&mut self, pgid: u32) {
        self.peer_group = Some(pgid);
    }

    /// Returns `true` once a simulator has connected.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Waits for the simulator to connect.
    ///
    /// Polls a non-blocking accept, sleeping `backoff.0` after the first miss
    /// and doubling up to `backoff.1`. Between attempts `liveness` is called;
    /// an error from it (typically "process exited") aborts the wait.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ProcessStartup`] if nothing connects within `budget`
    ///   or a connection is already established
    /// - [`BridgeError::ProcessStopped`] if interrupted
    /// - whatever `liveness` returns
    pub fn accept_connection(
        &mut self,
        budget: Duration,
        backoff: (Duration, Duration),
        mut liveness: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        if self.stream.is_some() {
            return Err(BridgeError::ProcessStartup(
                "a simulator is already connected".to_string(),
            ));
        }

        self.listener.set_nonblocking(true)?;
        let deadline = Instant::now() + budget;
        let (mut delay, max_delay) = backoff;

        loop {
            if self.interrupter.is_interrupted() {
                return Err(BridgeError::ProcessStopped(
                    "stopped while waiting for the simulator to connect".to_string(),
                ));
            }
            match self.listener.accept() {
                Ok((stream, _)) if !peer_in_group(&stream, self.peer_group) => {
                    log::warn!(
                        "[transport] rejecting connection from outside the simulator on {}",
                        self.path.display()
                    );
                    let _ = stream.shutdown(Shutdown::Both);
                }
                Ok((stream, _)) => {
                    // Accepted sockets inherit O_NONBLOCK on some platforms.
                    stream.set_nonblocking(false)?;
                    self.interrupter.arm(&stream)?;
                    self.stream = Some(stream);
                    log::info!("[transport] simulator connected on {}", self.path.display());
                    return Ok(());
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    if let Err(e) = liveness() {
                        // A stop kills the process; report the stop, not the exit.
                        if self.interrupter.is_interrupted() {
                            return Err(stopped());
                        }
                        return Err(e);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BridgeError::ProcessStartup(format!(
                            "simulator did not connect within {budget:?}"
                        )));
                    }
                    thread::sleep(delay.min(deadline - now));
                    delay = (delay * 2).min(max_delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Accepts and immediately closes any pending extra connections.
    ///
    /// Returns how many were rejected.
    pub fn reject_extra_connections(&self) -> usize {
        if self.stream.is_none() {
            return 0;
        }
        reject_pending(&self.listener, &self.path)
    }

    /// Writes one complete envelope.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ProcessStopped`] if interrupted or the peer is gone
    /// - [`BridgeError::SimulatorNotRunning`] if nothing is connected
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.interrupter.is_interrupted() {
            return Err(stopped());
        }
        self.reject_extra_connections();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BridgeError::SimulatorNotRunning("no simulator connected".to_string()))?;

        match stream.write_all(bytes).and_then(|()| stream.flush()) {
            Ok(()) => Ok(()),
            Err(_) if self.interrupter.is_interrupted() => Err(stopped()),
            Err(e) if is_disconnect(e.kind()) => Err(BridgeError::ProcessStopped(format!(
                "simulator closed the connection: {e}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until one complete envelope is available or `timeout` elapses.
    ///
    /// Reads in [`READ_SLICE`] chunks so the deadline and the interrupt flag
    /// are checked regularly. Extra envelopes that arrive in the same read
    /// are queued for the next call.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::TransportTimeout`] when `timeout` elapses
    /// - [`BridgeError::ProcessStopped`] on EOF, reset, or interrupt
    /// - [`BridgeError::MalformedFrame`] on bad envelope framing
    pub fn receive(&mut self, timeout: Duration) -> Result<Envelope> {
        if let Some(envelope) = self.pending.pop_front() {
            return Ok(envelope);
        }
        let Self {
            path,
            listener,
            stream,
            decoder,
            pending,
            interrupter,
            ..
        } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| BridgeError::SimulatorNotRunning("no simulator connected".to_string()))?;

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if interrupter.is_interrupted() {
                return Err(stopped());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::TransportTimeout(timeout));
            }
            reject_pending(listener, path);
            stream.set_read_timeout(Some(READ_SLICE.min(deadline - now)))?;

            match stream.read(&mut buf) {
                Ok(0) => {
                    if interrupter.is_interrupted() {
                        return Err(stopped());
                    }
                    return Err(BridgeError::ProcessStopped(
                        "simulator closed the connection".to_string(),
                    ));
                }
                Ok(n) => {
                    pending.extend(decoder.feed(&buf[..n])?);
                    if let Some(envelope) = pending.pop_front() {
                        return Ok(envelope);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(_) if interrupter.is_interrupted() => return Err(stopped()),
                Err(e) if is_disconnect(e.kind()) => {
                    return Err(BridgeError::ProcessStopped(format!(
                        "simulator connection lost: {e}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Accepts and shuts down everything queued on `listener`.
fn reject_pending(listener: &UnixListener, path: &Path) -> usize {
    let mut rejected = 0;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                log::warn!("[transport] rejecting extra connection on {}", path.display());
                let _ = stream.shutdown(Shutdown::Both);
                rejected += 1;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                log::warn!("[transport] accept error while rejecting: {e}");
                break;
            }
        }
    }
    rejected
}

#[cfg(target_os = "linux")]
fn peer_in_group(stream: &UnixStream, pgid: Option<u32>) -> bool {
    use std::os::fd::AsRawFd;

    let Some(pgid) = pgid else {
        return true;
    };
    let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: `cred` and `len` are valid for writes of the size passed.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        log::warn!(
            "[transport] SO_PEERCRED failed: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }
    if cred.pid as u32 == pgid {
        return true;
    }
    // SAFETY: getpgid has no memory-safety preconditions.
    let peer_group = unsafe { libc::getpgid(cred.pid) };
    log::debug!(
        "[transport] peer pid {} group {peer_group}, expected group {pgid}",
        cred.pid
    );
    peer_group >= 0 && peer_group as u32 == pgid
}

#[cfg(not(target_os = "linux"))]
fn peer_in_group(_stream: &UnixStream, _pgid: Option<u32>) -> bool {
    true
}

fn stopped() -> BridgeError {
    BridgeError::ProcessStopped("session was stopped".to_string())
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("[transport] removed {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("[transport] failed to remove {}: {e}", self.path.display()),
        }
    }
}
