//! Configuration file support for tunkeepd
//!
//! Loads and validates the tunnel description from a TOML file.
//! Default location: /etc/tunkeep/tunkeep.toml
//!
//! The `[tunnel]`, `[credentials]` and `[control_plane]` sections are
//! re-read through [`ConfigSource`] before every repair attempt. The
//! `[timing]` section is only read at startup.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tunkeep_common::{KeeperError, KeeperResult};

use crate::types::{Credentials, Ipv6Prefix, TunnelConfig, DEFAULT_KERNEL_MODULES};
use crate::updater::{build_update_url, DEFAULT_UPDATE_URL};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tunkeep/tunkeep.toml";

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
const MAX_IFNAME_LEN: usize = 15;

/// `[tunnel]` section
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    pub interface: String,
    pub server_ipv4: Ipv4Addr,
    pub client_ipv4: Ipv4Addr,
    pub server_ipv6: Ipv6Prefix,
    pub client_ipv6: Ipv6Prefix,

    #[serde(default = "default_kernel_modules")]
    pub kernel_modules: Vec<String>,
}

/// `[timing]` section
#[derive(Debug, Clone, Deserialize)]
pub struct TimingSection {
    /// Base polling frequency in seconds
    #[serde(default = "default_frequency")]
    pub frequency_secs: u64,

    /// Probe timeout in seconds
    #[serde(default = "default_max_latency")]
    pub max_latency_secs: u64,

    /// Upper bound for repair backoff in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Control-plane request timeout in seconds
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,
}

/// `[control_plane]` section
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneSection {
    #[serde(default = "default_update_url")]
    pub update_url: String,
}

/// Complete tunkeepd configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct KeeperFile {
    pub tunnel: TunnelSection,
    pub credentials: Credentials,

    #[serde(default)]
    pub timing: TimingSection,

    #[serde(default)]
    pub control_plane: ControlPlaneSection,
}

fn default_kernel_modules() -> Vec<String> {
    DEFAULT_KERNEL_MODULES.iter().map(|m| m.to_string()).collect()
}

fn default_frequency() -> u64 {
    60
}

fn default_max_latency() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    3600
}

fn default_update_timeout() -> u64 {
    30
}

fn default_update_url() -> String {
    DEFAULT_UPDATE_URL.to_string()
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            frequency_secs: default_frequency(),
            max_latency_secs: default_max_latency(),
            max_backoff_secs: default_max_backoff(),
            update_timeout_secs: default_update_timeout(),
        }
    }
}

impl Default for ControlPlaneSection {
    fn default() -> Self {
        Self {
            update_url: default_update_url(),
        }
    }
}

impl KeeperFile {
    /// Parses TOML text. `origin` names the source in error messages.
    pub fn parse(content: &str, origin: &str) -> KeeperResult<Self> {
        toml::from_str(content).map_err(|e| KeeperError::config_load(origin, e.to_string()))
    }

    /// Reads and parses a configuration file.
    pub fn load(path: impl AsRef<Path>) -> KeeperResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| KeeperError::config_load(path.display().to_string(), e.to_string()))?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Validates the file and produces the tunnel description.
    pub fn tunnel_config(&self) -> KeeperResult<TunnelConfig> {
        let t = &self.tunnel;
        validate_ifname(&t.interface)?;

        if t.server_ipv4.is_unspecified() {
            return Err(KeeperError::invalid_config(
                "tunnel.server_ipv4",
                "must be a concrete address",
            ));
        }
        if t.server_ipv6.addr() == t.client_ipv6.addr() {
            return Err(KeeperError::invalid_config(
                "tunnel.client_ipv6",
                "must differ from tunnel.server_ipv6",
            ));
        }
        if let Some(m) = t
            .kernel_modules
            .iter()
            .find(|m| m.is_empty() || m.contains(char::is_whitespace))
        {
            return Err(KeeperError::invalid_config(
                "tunnel.kernel_modules",
                format!("invalid module name '{}'", m),
            ));
        }

        let c = &self.credentials;
        for (field, value) in [
            ("credentials.username", &c.username),
            ("credentials.password", &c.password),
            ("credentials.tunnel_id", &c.tunnel_id),
        ] {
            if value.trim().is_empty() {
                return Err(KeeperError::invalid_config(field, "must not be empty"));
            }
        }

        build_update_url(&self.control_plane.update_url, &c.tunnel_id)?;

        Ok(TunnelConfig {
            interface: t.interface.clone(),
            server_ipv4: t.server_ipv4,
            client_ipv4: t.client_ipv4,
            server_ipv6: t.server_ipv6,
            client_ipv6: t.client_ipv6,
            kernel_modules: t.kernel_modules.clone(),
            credentials: c.clone(),
            update_url: self.control_plane.update_url.clone(),
        })
    }
}

fn validate_ifname(name: &str) -> KeeperResult<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(KeeperError::invalid_config(
            "tunnel.interface",
            format!("must be 1-{} characters", MAX_IFNAME_LEN),
        ));
    }
    if name.contains('/') || name.contains(char::is_whitespace) {
        return Err(KeeperError::invalid_config(
            "tunnel.interface",
            "must not contain '/' or whitespace",
        ));
    }
    Ok(())
}

/// Timing knobs and run mode, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperSettings {
    pub frequency_secs: u64,
    pub max_latency_secs: u64,
    pub max_backoff_secs: u64,
    pub update_timeout_secs: u64,
    /// Loop forever; when false, run one cycle and return.
    pub daemon: bool,
}

impl Default for KeeperSettings {
    fn default() -> Self {
        Self::from_timing(&TimingSection::default(), true)
    }
}

impl KeeperSettings {
    pub fn from_timing(timing: &TimingSection, daemon: bool) -> Self {
        Self {
            frequency_secs: timing.frequency_secs,
            max_latency_secs: timing.max_latency_secs,
            max_backoff_secs: timing.max_backoff_secs,
            update_timeout_secs: timing.update_timeout_secs,
            daemon,
        }
    }

    pub fn validate(&self) -> KeeperResult<()> {
        if self.frequency_secs == 0 {
            return Err(KeeperError::invalid_config(
                "timing.frequency_secs",
                "must be greater than 0",
            ));
        }
        if self.max_latency_secs == 0 {
            return Err(KeeperError::invalid_config(
                "timing.max_latency_secs",
                "must be greater than 0",
            ));
        }
        if self.max_backoff_secs < self.frequency_secs {
            return Err(KeeperError::invalid_config(
                "timing.max_backoff_secs",
                "must be at least timing.frequency_secs",
            ));
        }
        if self.update_timeout_secs == 0 {
            return Err(KeeperError::invalid_config(
                "timing.update_timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
}

/// Supplies a fresh [`TunnelConfig`] on demand.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> KeeperResult<TunnelConfig>;
}

/// Re-reads a TOML file on every [`ConfigSource::load`].
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Startup-only timing section of the file.
    pub fn timing(&self) -> KeeperResult<TimingSection> {
        Ok(KeeperFile::load(&self.path)?.timing)
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> KeeperResult<TunnelConfig> {
        KeeperFile::load(&self.path)?.tunnel_config()
    }
}

/// Always returns the same configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigSource(pub TunnelConfig);

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> KeeperResult<TunnelConfig> {
        Ok(self.0.clone())
    }
}
