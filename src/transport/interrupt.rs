//! Cross-thread wakeup for a blocked transport.

use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Flag plus stream handle that lets another thread abort a blocked
/// `accept_connection()` or `receive()`.
///
/// Setting the flag is enough for the polling loops (they wake every
/// [`READ_SLICE`](crate::constants::READ_SLICE)); shutting the armed stream
/// down additionally wakes a reader immediately.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    interrupted: AtomicBool,
    stream: Mutex<Option<UnixStream>>,
}

impl Interrupter {
    /// Creates a clear interrupter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and shuts the armed stream down, if any.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        let guard = self.inner.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = guard.as_ref() {
            // Already-closed streams report NotConnected; nothing to wake.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Returns `true` once [`Interrupter::interrupt`] has been called.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Clears the flag and forgets the armed stream.
    pub fn reset(&self) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
        *self.inner.stream.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Keeps a clone of `stream` so [`Interrupter::interrupt`] can shut it down.
    pub(crate) fn arm(&self, stream: &UnixStream) -> std::io::Result<()> {
        let clone = stream.try_clone()?;
        *self.inner.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(clone);
        // Raised before we stored the clone: interrupt() saw nothing to shut.
        if self.is_interrupted() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }
}
