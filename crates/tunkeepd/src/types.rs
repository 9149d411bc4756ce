//! Tunnel type definitions and constants

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::Deserialize;

/// Hop limit for the outer IPv4 header of a newly created tunnel.
pub const TUNNEL_TTL: u8 = 255;

/// Tunnel mode passed to `ip tunnel` (IPv6-in-IPv4).
pub const TUNNEL_MODE_SIT: &str = "sit";

/// Kernel modules a sit tunnel needs when none are configured.
pub const DEFAULT_KERNEL_MODULES: &[&str] = &["ipv6", "sit"];

/// IPv6 address with prefix length, e.g. `2001:db8::2/64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Ipv6Prefix {
    addr: Ipv6Addr,
    len: u8,
}

impl Ipv6Prefix {
    pub fn new(addr: Ipv6Addr, len: u8) -> Result<Self, String> {
        if len > 128 {
            return Err(format!("Invalid IPv6 prefix length: {}", len));
        }
        Ok(Self { addr, len })
    }

    /// The address portion, used for probing.
    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for Ipv6Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("Invalid IPv6 prefix (missing length): {}", s))?;
        let addr = addr
            .parse::<Ipv6Addr>()
            .map_err(|_| format!("Invalid IPv6 address: {}", addr))?;
        let len = len
            .parse::<u8>()
            .map_err(|_| format!("Invalid IPv6 prefix length: {}", len))?;
        Self::new(addr, len)
    }
}

impl TryFrom<String> for Ipv6Prefix {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Credentials for the provider's control-plane update endpoint.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Provider-side tunnel identifier.
    pub tunnel_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tunnel_id", &self.tunnel_id)
            .finish()
    }
}

/// Everything needed to reconcile one tunnel.
///
/// A value is never mutated while a repair is in flight; the keeper swaps
/// in a freshly loaded one only before starting a repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub interface: String,
    pub server_ipv4: Ipv4Addr,
    pub client_ipv4: Ipv4Addr,
    pub server_ipv6: Ipv6Prefix,
    pub client_ipv6: Ipv6Prefix,
    pub kernel_modules: Vec<String>,
    pub credentials: Credentials,
    /// Control-plane update URL (without the tunnel id query).
    pub update_url: String,
}

impl TunnelConfig {
    /// Endpoints the tunnel device should carry.
    pub fn endpoints(&self) -> TunnelEndpoints {
        TunnelEndpoints {
            remote: self.server_ipv4,
            local: self.client_ipv4,
        }
    }

    /// Address probed to decide whether IPv6 works.
    pub fn ipv6_probe_target(&self) -> IpAddr {
        IpAddr::V6(self.server_ipv6.addr())
    }

    /// Address probed to decide whether the outer IPv4 path works.
    pub fn ipv4_probe_target(&self) -> IpAddr {
        IpAddr::V4(self.server_ipv4)
    }
}

/// Outer IPv4 endpoints of a sit tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelEndpoints {
    pub remote: Ipv4Addr,
    pub local: Ipv4Addr,
}

/// Live snapshot of the tunnel interface, taken during one repair.
///
/// `None` for endpoints or admin state means the interface does not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceObservation {
    pub endpoints: Option<TunnelEndpoints>,
    pub admin_up: Option<bool>,
    pub global_ipv6: Vec<Ipv6Prefix>,
    pub default_route_dev: Option<String>,
}

/// How a reconciliation cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// IPv6 reachable, either straight away or after local repair.
    Healthy,
    /// Neither IPv6 nor IPv4 reachable; nothing was touched.
    Ipv4Down,
    /// Local repair did not help; the control-plane update was accepted.
    Ipv6DownRepairAttempted,
    /// Local repair did not help and the control-plane update failed.
    Ipv6DownRepairFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Healthy => "healthy",
            Outcome::Ipv4Down => "ipv4-down",
            Outcome::Ipv6DownRepairAttempted => "ipv6-down-repair-attempted",
            Outcome::Ipv6DownRepairFailed => "ipv6-down-repair-failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
