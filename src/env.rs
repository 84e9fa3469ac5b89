//! Runtime environment detection.
//!
//! Single source of truth for the runtime environment, driven by the
//! `SIMBRIDGE_ENV` environment variable.
//!
//! Set `SIMBRIDGE_ENV` to one of:
//! - `test` - Test mode (config, caches and sockets live under the system temp dir)
//! - (anything else or unset) - Production mode

use std::path::PathBuf;

/// Runtime environment for the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Test environment - keeps every file under the system temp dir.
    Test,
}

impl Environment {
    /// Detect current environment from `SIMBRIDGE_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var("SIMBRIDGE_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Root directory for throwaway state in test mode.
    pub(crate) fn test_root() -> PathBuf {
        std::env::temp_dir().join("simbridge-test")
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Test.to_string(), "test");
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse(Some("test")), Environment::Test);
        assert_eq!(Environment::parse(Some("dev")), Environment::Production);
        assert_eq!(Environment::parse(Some("staging")), Environment::Production);
        assert_eq!(Environment::parse(None), Environment::Production);
    }

    #[test]
    fn test_environment_is_test() {
        assert!(Environment::Test.is_test());
        assert!(!Environment::Production.is_test());
    }

    #[test]
    fn test_test_environment_keeps_state_under_temp_dir() {
        let root = Environment::test_root();
        assert!(root.starts_with(std::env::temp_dir()));
        assert!(root.ends_with("simbridge-test"));
    }
}
