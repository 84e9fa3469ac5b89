//! Binary-fetch collaborator: turns a platform + version into a local,
//! executable simulator path.
//!
//! The controller calls [`BinaryFetcher::fetch`] once per `start()`.
//! [`HttpBinaryFetcher`] downloads published builds into a cache and
//! verifies them against a `.sha256` sibling when one is published;
//! [`LocalBinary`] points at an already-installed executable.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::BridgeConfig;
use crate::constants::{SIMULATOR_BINARY_NAME, USER_AGENT};

/// Host platform identifier, e.g. `linux-x86_64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    os: &'static str,
    arch: &'static str,
}

/// Platforms for which builds are published.
const PUBLISHED: [&str; 3] = ["linux-x86_64", "macos-arm64", "macos-x86_64"];

impl Platform {
    /// Creates a platform from OS and architecture names.
    pub const fn new(os: &'static str, arch: &'static str) -> Self {
        Self { os, arch }
    }

    /// The platform this process runs on.
    pub fn current() -> Self {
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(std::env::consts::OS, arch)
    }

    /// Returns `true` if simulator builds are published for this platform.
    pub fn is_published(self) -> bool {
        PUBLISHED.contains(&self.to_string().as_str())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// Provides a ready-to-execute simulator binary.
pub trait BinaryFetcher: Send + Sync {
    /// Returns the path of an executable build for `platform` and `version`,
    /// downloading it first if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if no build can be provided.
    fn fetch(&self, platform: Platform, version: &str) -> Result<PathBuf>;
}

/// An executable that is already on disk.
#[derive(Debug, Clone)]
pub struct LocalBinary {
    path: PathBuf,
}

impl LocalBinary {
    /// Wraps an existing executable path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BinaryFetcher for LocalBinary {
    fn fetch(&self, _platform: Platform, _version: &str) -> Result<PathBuf> {
        if !self.path.is_file() {
            bail!("simulator binary not found: {}", self.path.display());
        }
        Ok(self.path.clone())
    }
}

/// Downloads published builds over HTTP into a local cache.
///
/// Layout: `{cache_dir}/{version}/{platform}/simulator`. A cached build is
/// returned without touching the network.
#[derive(Debug)]
pub struct HttpBinaryFetcher {
    base_url: String,
    cache_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl HttpBinaryFetcher {
    /// Creates a fetcher for `base_url`, caching under `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache_dir: cache_dir.into(),
            client,
        })
    }

    /// Creates a fetcher from the download settings in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Self::new(config.download_base_url.clone(), config.cache_dir.clone())
    }

    /// Where the build for `platform`/`version` is (or would be) cached.
    pub fn cached_path(&self, platform: Platform, version: &str) -> PathBuf {
        self.cache_dir
            .join(version)
            .join(platform.to_string())
            .join(SIMULATOR_BINARY_NAME)
    }

    fn download_url(&self, platform: Platform, version: &str) -> String {
        format!("{}/{version}/{SIMULATOR_BINARY_NAME}-{platform}", self.base_url)
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        self.client
            .get(url)
            .send()
            .with_context(|| format!("GET {url}"))
    }

    /// Checks `data` against the published `.sha256`, if any.
    fn verify_checksum(&self, url: &str, data: &[u8]) -> Result<()> {
        use sha2::{Digest, Sha256};

        let checksum_url = format!("{url}.sha256");
        let response = self.get(&checksum_url)?;
        if !response.status().is_success() {
            log::warn!("[fetch] no checksum published at {checksum_url} ({})", response.status());
            return Ok(());
        }
        let text = response.text().context("read checksum")?;
        let expected = text
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow::anyhow!("invalid checksum format at {checksum_url}"))?;

        let actual = format!("{:x}", Sha256::digest(data));
        if !actual.eq_ignore_ascii_case(expected) {
            bail!("checksum mismatch for {url}: expected {expected}, got {actual}");
        }
        log::debug!("[fetch] checksum verified for {url}");
        Ok(())
    }
}

fn check_version(version: &str) -> Result<()> {
    if version.is_empty()
        || version == "."
        || version == ".."
        || version.contains(['/', '\\'])
    {
        bail!("invalid build version: {version:?}");
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

impl BinaryFetcher for HttpBinaryFetcher {
    fn fetch(&self, platform: Platform, version: &str) -> Result<PathBuf> {
        check_version(version)?;
        if !platform.is_published() {
            bail!("no simulator builds are published for {platform}");
        }

        let target = self.cached_path(platform, version);
        if is_executable(&target) {
            log::debug!("[fetch] using cached build {}", target.display());
            return Ok(target);
        }

        let url = self.download_url(platform, version);
        log::info!("[fetch] downloading {url}");
        let response = self.get(&url)?;
        if !response.status().is_success() {
            bail!("failed to download {url}: {}", response.status());
        }
        let data = response.bytes().with_context(|| format!("read body of {url}"))?;
        self.verify_checksum(&url, &data)?;

        let dir = target
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cache path has no parent: {}", target.display()))?;
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

        let temp_path = target.with_extension("download");
        fs::write(&temp_path, &data).with_context(|| format!("write {}", temp_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o755))?;
        }
        fs::rename(&temp_path, &target)
            .with_context(|| format!("install {}", target.display()))?;

        log::info!("[fetch] cached {} ({} bytes)", target.display(), data.len());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_display() {
        assert_eq!(Platform::new("linux", "x86_64").to_string(), "linux-x86_64");
        assert!(Platform::new("macos", "arm64").is_published());
        assert!(!Platform::new("windows", "x86_64").is_published());
    }

    #[test]
    fn test_current_platform_uses_published_arch_names() {
        let platform = Platform::current().to_string();
        assert!(!platform.ends_with("aarch64"), "{platform}");
        assert!(platform.starts_with(std::env::consts::OS), "{platform}");
    }

    #[test]
    fn test_local_binary_requires_existing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = LocalBinary::new(tmp.path().join("nope"));
        assert!(missing.fetch(Platform::current(), "latest").is_err());

        let exe = tmp.path().join("sim");
        fs::write(&exe, b"#!/bin/sh\n").unwrap();
        let found = LocalBinary::new(&exe).fetch(Platform::current(), "latest").unwrap();
        assert_eq!(found, exe);
    }

    #[test]
    fn test_cached_path_layout() {
        let fetcher = HttpBinaryFetcher::new("http://example.invalid/builds/", "/cache").unwrap();
        let platform = Platform::new("linux", "x86_64");
        assert_eq!(
            fetcher.cached_path(platform, "v5"),
            PathBuf::from("/cache/v5/linux-x86_64/simulator")
        );
        assert_eq!(
            fetcher.download_url(platform, "v5"),
            "http://example.invalid/builds/v5/simulator-linux-x86_64"
        );
    }

    #[test]
    fn test_version_must_be_a_single_path_segment() {
        assert!(check_version("v1.2").is_ok());
        assert!(check_version("").is_err());
        assert!(check_version("..").is_err());
        assert!(check_version("../etc").is_err());
    }

    #[test]
    fn test_unpublished_platform_fails_without_network() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fetcher = HttpBinaryFetcher::new("http://127.0.0.1:9", tmp.path()).unwrap();
        let err = fetcher
            .fetch(Platform::new("plan9", "mips"), "latest")
            .unwrap_err();
        assert!(err.to_string().contains("plan9-mips"), "{err}");
    }
}
