//! Crate-wide constants for simbridge.
//!
//! Centralizes default timeouts, poll intervals and wire limits so the
//! transport, supervisor and controller agree on them.
//!
//! # Categories
//!
//! - **Timeouts**: startup, step and stop budgets
//! - **Polling**: accept backoff and read slicing
//! - **Wire**: envelope and socket path limits
//! - **Simulator defaults**: render size and movement granularity

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Budget for launching the simulator, accepting its connection and
/// receiving the handshake frame.
///
/// Simulator builds load a full scene before connecting, which can take
/// well over a minute on a cold cache.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Budget for a single action round trip.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(100);

/// How long `stop` waits after SIGTERM before escalating to SIGKILL.
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

// ============================================================================
// Polling
// ============================================================================

/// First sleep between non-blocking accept attempts.
pub const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);

/// Upper bound on the sleep between accept attempts.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Read timeout slice while waiting for a frame.
///
/// `receive()` wakes up this often to check its deadline and the stop flag.
pub const READ_SLICE: Duration = Duration::from_millis(50);

/// Poll interval while waiting for a signalled process to exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Wire
// ============================================================================

/// Maximum envelope payload size (256 MB).
///
/// Four full-HD modalities plus metadata fit comfortably.
pub const MAX_ENVELOPE_SIZE: u32 = 256 * 1024 * 1024;

/// Socket read buffer size.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum Unix socket path length (sun_path is 104 on macOS, 108 on Linux).
pub const MAX_SOCKET_PATH: usize = 104;

// ============================================================================
// Simulator defaults
// ============================================================================

/// Default render width in pixels.
pub const DEFAULT_WIDTH: u32 = 300;

/// Default render height in pixels.
pub const DEFAULT_HEIGHT: u32 = 300;

/// Default translation step for Move* actions, in meters.
pub const DEFAULT_GRID_SIZE: f32 = 0.25;

/// Default rotation step for Rotate* actions, in degrees.
pub const DEFAULT_ROTATE_STEP_DEGREES: f32 = 90.0;

/// Public bucket hosting simulator builds.
pub const DEFAULT_DOWNLOAD_BASE_URL: &str =
    "https://s3-us-west-2.amazonaws.com/ai2-thor-public/builds";

/// Build version fetched when none is configured.
pub const DEFAULT_BUILD_VERSION: &str = "latest";

/// File name prefix of published simulator builds.
pub const SIMULATOR_BINARY_NAME: &str = "simulator";

/// User-Agent header for build downloads.
pub const USER_AGENT: &str = concat!("simbridge/", env!("CARGO_PKG_VERSION"));
