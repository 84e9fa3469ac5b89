//! Configuration loading and persistence.
//!
//! [`BridgeConfig`] holds every tunable of a session: timeouts, render
//! settings, socket placement and the build to fetch. It is read from
//! `config.json` in the config directory and then overridden from
//! `SIMBRIDGE_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf, time::Duration};

use crate::constants;
use crate::env::Environment;

/// Image modalities requested from the simulator in addition to color.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Modalities {
    /// Render a depth map.
    pub depth: bool,
    /// Render per-object instance segmentation.
    pub instance_segmentation: bool,
    /// Render semantic class masks.
    pub class_masks: bool,
}

/// Configuration for one controller session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Budget for launch, connection and handshake, in milliseconds.
    pub startup_timeout_ms: u64,
    /// Budget for a single action round trip, in milliseconds.
    pub step_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop, in milliseconds.
    pub stop_grace_period_ms: u64,
    /// First accept retry delay, in milliseconds.
    pub accept_backoff_initial_ms: u64,
    /// Largest accept retry delay, in milliseconds.
    pub accept_backoff_max_ms: u64,
    /// Directory for session sockets.
    pub socket_dir: PathBuf,
    /// Working directory for the simulator (inherited when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Render width in pixels.
    pub width: u32,
    /// Render height in pixels.
    pub height: u32,
    /// Run without a window.
    pub headless: bool,
    /// Extra image modalities.
    pub modalities: Modalities,
    /// Default translation step, passed to the simulator as `--grid-size`.
    pub grid_size: f32,
    /// Default rotation step, passed as `--rotate-step-degrees`.
    pub rotate_step_degrees: f32,
    /// Additional flags appended verbatim to the launch command.
    pub extra_args: Vec<String>,
    /// Base URL simulator builds are downloaded from.
    pub download_base_url: String,
    /// Simulator build version.
    pub build_version: String,
    /// Directory downloaded builds are cached in.
    pub cache_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let environment = Environment::current();
        log::debug!("[config] defaults for the {environment} environment");
        let (socket_dir, cache_dir) = if environment.is_test() {
            let root = Environment::test_root();
            (root.join("sockets"), root.join("builds"))
        } else {
            let socket_dir = std::env::temp_dir().join(format!("simbridge-{}", current_uid()));
            let cache_dir = dirs::cache_dir()
                .map(|c| c.join("simbridge/builds"))
                .unwrap_or_else(|| {
                    log::warn!("Could not determine cache directory, using temp dir for builds");
                    std::env::temp_dir().join("simbridge-builds")
                });
            (socket_dir, cache_dir)
        };

        Self {
            startup_timeout_ms: millis(constants::DEFAULT_STARTUP_TIMEOUT),
            step_timeout_ms: millis(constants::DEFAULT_STEP_TIMEOUT),
            stop_grace_period_ms: millis(constants::DEFAULT_STOP_GRACE_PERIOD),
            accept_backoff_initial_ms: millis(constants::ACCEPT_BACKOFF_INITIAL),
            accept_backoff_max_ms: millis(constants::ACCEPT_BACKOFF_MAX),
            socket_dir,
            working_dir: None,
            width: constants::DEFAULT_WIDTH,
            height: constants::DEFAULT_HEIGHT,
            headless: true,
            modalities: Modalities::default(),
            grid_size: constants::DEFAULT_GRID_SIZE,
            rotate_step_degrees: constants::DEFAULT_ROTATE_STEP_DEGREES,
            extra_args: Vec::new(),
            download_base_url: constants::DEFAULT_DOWNLOAD_BASE_URL.to_string(),
            build_version: constants::DEFAULT_BUILD_VERSION.to_string(),
            cache_dir,
        }
    }
}

impl BridgeConfig {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `SIMBRIDGE_CONFIG_DIR` env var: explicit override
    /// 2. `SIMBRIDGE_ENV=test`: `<tmp>/simbridge-test`
    /// 3. Default: platform config dir (`~/.config/simbridge` on Linux)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SIMBRIDGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if Environment::current().is_test() {
            Environment::test_root()
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("simbridge")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file yields the defaults; a present but unparseable file is
    /// an error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?.unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Option<Self>> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_u64("SIMBRIDGE_STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = ms;
        }

        if let Some(ms) = env_u64("SIMBRIDGE_STEP_TIMEOUT_MS") {
            self.step_timeout_ms = ms;
        }

        if let Ok(dir) = std::env::var("SIMBRIDGE_SOCKET_DIR") {
            self.socket_dir = PathBuf::from(dir);
        }

        if let Ok(headless) = std::env::var("SIMBRIDGE_HEADLESS") {
            self.headless = matches!(headless.as_str(), "1" | "true" | "yes");
        }

        if let Ok(version) = std::env::var("SIMBRIDGE_BUILD_VERSION") {
            self.build_version = version;
        }

        if let Ok(url) = std::env::var("SIMBRIDGE_DOWNLOAD_URL") {
            self.download_base_url = url;
        }

        if let Ok(dir) = std::env::var("SIMBRIDGE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
    }

    /// Persists the current configuration to disk (owner read/write only).
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Checks values that would make a session unusable before any process
    /// is launched.
    pub fn validate(&self) -> crate::Result<()> {
        let problem = if self.width == 0 || self.height == 0 {
            Some(format!("render size must be non-zero, got {}x{}", self.width, self.height))
        } else if self.startup_timeout_ms == 0 || self.step_timeout_ms == 0 {
            Some("startup and step timeouts must be non-zero".to_string())
        } else if !(self.grid_size.is_finite() && self.grid_size > 0.0) {
            Some(format!("grid_size must be positive, got {}", self.grid_size))
        } else if !(self.rotate_step_degrees.is_finite() && self.rotate_step_degrees > 0.0) {
            Some(format!(
                "rotate_step_degrees must be positive, got {}",
                self.rotate_step_degrees
            ))
        } else {
            None
        };
        match problem {
            Some(msg) => Err(crate::BridgeError::Config(anyhow::anyhow!(msg))),
            None => Ok(()),
        }
    }

    /// Startup budget.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Per-step budget.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Grace period before force-killing on stop.
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    /// Accept retry delays as `(initial, max)`.
    pub fn accept_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.accept_backoff_initial_ms),
            Duration::from_millis(self.accept_backoff_max_ms.max(self.accept_backoff_initial_ms)),
        )
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

/// Current user id, used to keep per-user socket directories apart.
pub(crate) fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}
