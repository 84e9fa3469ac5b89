//! Command line the simulator binary is launched with.
//!
//! These flags are the contract an external simulator build must honor:
//!
//! ```text
//! simulator --socket <path> --width <px> --height <px>
//!           --grid-size <m> --rotate-step-degrees <deg>
//!           [--headless] [--render-depth]
//!           [--render-instance-segmentation] [--render-class-masks]
//!           [extra args...]
//! ```
//!
//! `--socket` is the only flag without which a build cannot work; a binary
//! that rejects it exits before connecting and surfaces as
//! [`BridgeError::ProcessStartup`].

use std::path::{Path, PathBuf};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Flag names.
pub mod flags {
    /// Unix socket path to connect to.
    pub const SOCKET: &str = "--socket";
    /// Render width in pixels.
    pub const WIDTH: &str = "--width";
    /// Render height in pixels.
    pub const HEIGHT: &str = "--height";
    /// Default translation step in meters.
    pub const GRID_SIZE: &str = "--grid-size";
    /// Default rotation step in degrees.
    pub const ROTATE_STEP_DEGREES: &str = "--rotate-step-degrees";
    /// Run without a window.
    pub const HEADLESS: &str = "--headless";
    /// Emit a depth channel.
    pub const RENDER_DEPTH: &str = "--render-depth";
    /// Emit an instance segmentation channel.
    pub const RENDER_INSTANCE_SEGMENTATION: &str = "--render-instance-segmentation";
    /// Emit a semantic class mask channel.
    pub const RENDER_CLASS_MASKS: &str = "--render-class-masks";
}

/// Everything needed to spawn one simulator process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable.
    pub binary: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory, inherited when `None`.
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Builds the launch command for `binary` listening on `socket_path`.
    pub fn new(binary: PathBuf, socket_path: &Path, config: &BridgeConfig) -> Self {
        let mut args = vec![
            flags::SOCKET.to_string(),
            socket_path.display().to_string(),
            flags::WIDTH.to_string(),
            config.width.to_string(),
            flags::HEIGHT.to_string(),
            config.height.to_string(),
            flags::GRID_SIZE.to_string(),
            config.grid_size.to_string(),
            flags::ROTATE_STEP_DEGREES.to_string(),
            config.rotate_step_degrees.to_string(),
        ];
        if config.headless {
            args.push(flags::HEADLESS.to_string());
        }
        if config.modalities.depth {
            args.push(flags::RENDER_DEPTH.to_string());
        }
        if config.modalities.instance_segmentation {
            args.push(flags::RENDER_INSTANCE_SEGMENTATION.to_string());
        }
        if config.modalities.class_masks {
            args.push(flags::RENDER_CLASS_MASKS.to_string());
        }
        args.extend(config.extra_args.iter().cloned());

        Self {
            binary,
            args,
            working_dir: config.working_dir.clone(),
        }
    }

    /// Checks that the binary is an executable file and the working
    /// directory exists.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ProcessStartup`] describing what is missing.
    pub fn validate(&self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let meta = std::fs::metadata(&self.binary).map_err(|e| {
            BridgeError::ProcessStartup(format!("simulator binary {}: {e}", self.binary.display()))
        })?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(BridgeError::ProcessStartup(format!(
                "simulator binary {} is not an executable file",
                self.binary.display()
            )));
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                return Err(BridgeError::ProcessStartup(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Modalities;

    #[test]
    fn test_default_flags() {
        let config = BridgeConfig {
            width: 640,
            height: 480,
            headless: false,
            grid_size: 0.5,
            rotate_step_degrees: 45.0,
            ..BridgeConfig::default()
        };
        let spec = LaunchSpec::new(PathBuf::from("/opt/sim"), Path::new("/tmp/s.sock"), &config);
        assert_eq!(
            spec.args,
            vec![
                "--socket",
                "/tmp/s.sock",
                "--width",
                "640",
                "--height",
                "480",
                "--grid-size",
                "0.5",
                "--rotate-step-degrees",
                "45",
            ]
        );
    }

    #[test]
    fn test_modalities_headless_and_extra_args() {
        let config = BridgeConfig {
            headless: true,
            modalities: Modalities {
                depth: true,
                instance_segmentation: false,
                class_masks: true,
            },
            extra_args: vec!["--quality".into(), "Low".into()],
            ..BridgeConfig::default()
        };
        let spec = LaunchSpec::new(PathBuf::from("/opt/sim"), Path::new("/tmp/s.sock"), &config);
        let tail: Vec<&str> = spec.args[10..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["--headless", "--render-depth", "--render-class-masks", "--quality", "Low"]
        );
    }

    #[test]
    fn test_validate_rejects_missing_and_non_executable() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let config = BridgeConfig::default();
        let sock = tmp.path().join("s.sock");

        let missing = LaunchSpec::new(tmp.path().join("missing"), &sock, &config);
        assert!(matches!(missing.validate(), Err(BridgeError::ProcessStartup(_))));

        let plain = tmp.path().join("plain");
        std::fs::write(&plain, b"data").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();
        let spec = LaunchSpec::new(plain.clone(), &sock, &config);
        assert!(spec.validate().unwrap_err().to_string().contains("not an executable"));

        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(LaunchSpec::new(plain, &sock, &config).validate().is_ok());
    }
}
