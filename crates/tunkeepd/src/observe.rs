//! Typed views of iproute2 JSON output.
//!
//! The reconciler never looks at command output directly; it only sees the
//! values produced here.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::Deserialize;
use tunkeep_common::{KeeperError, KeeperResult};

use crate::types::{Ipv6Prefix, TunnelEndpoints};

/// Link state of an existing interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    /// `None` when the device carries no tunnel endpoint data.
    pub endpoints: Option<TunnelEndpoints>,
    pub admin_up: bool,
}

#[derive(Debug, Deserialize)]
struct LinkJson {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    linkinfo: Option<LinkInfoJson>,
}

#[derive(Debug, Deserialize)]
struct LinkInfoJson {
    #[serde(default)]
    info_data: Option<TunnelDataJson>,
}

#[derive(Debug, Deserialize)]
struct TunnelDataJson {
    remote: Option<String>,
    local: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddrJson {
    #[serde(default)]
    addr_info: Vec<AddrInfoJson>,
}

#[derive(Debug, Deserialize)]
struct AddrInfoJson {
    family: String,
    local: String,
    prefixlen: u8,
    #[serde(default)]
    scope: String,
}

#[derive(Debug, Deserialize)]
struct RouteJson {
    dst: String,
    dev: Option<String>,
}

fn parse_json_array<T: for<'de> Deserialize<'de>>(what: &str, output: &str) -> KeeperResult<Vec<T>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(output).map_err(|e| KeeperError::parse(what, e.to_string()))
}

/// `ip` prints `any` for an unset tunnel endpoint.
fn parse_endpoint(what: &str, value: Option<&str>) -> KeeperResult<Ipv4Addr> {
    match value {
        None | Some("any") => Ok(Ipv4Addr::UNSPECIFIED),
        Some(v) => v
            .parse()
            .map_err(|_| KeeperError::parse(what, format!("Invalid IPv4 endpoint: {}", v))),
    }
}

/// Parses `ip -j -d link show dev <if>`.
pub fn parse_link(output: &str) -> KeeperResult<LinkState> {
    let links: Vec<LinkJson> = parse_json_array("link state", output)?;
    let link = links
        .into_iter()
        .next()
        .ok_or_else(|| KeeperError::parse("link state", "empty link list"))?;

    let endpoints = match link.linkinfo.and_then(|li| li.info_data) {
        Some(data) => Some(TunnelEndpoints {
            remote: parse_endpoint("tunnel remote", data.remote.as_deref())?,
            local: parse_endpoint("tunnel local", data.local.as_deref())?,
        }),
        None => None,
    };

    Ok(LinkState {
        endpoints,
        admin_up: link.flags.iter().any(|f| f == "UP"),
    })
}

/// Parses `ip -j -6 addr show dev <if> scope global`.
pub fn parse_global_addrs(output: &str) -> KeeperResult<Vec<Ipv6Prefix>> {
    let entries: Vec<AddrJson> = parse_json_array("interface addresses", output)?;
    entries
        .into_iter()
        .flat_map(|e| e.addr_info)
        .filter(|a| a.family == "inet6" && a.scope == "global")
        .map(|a| {
            let addr = a.local.parse().map_err(|_| {
                KeeperError::parse("interface addresses", format!("Invalid IPv6: {}", a.local))
            })?;
            Ipv6Prefix::new(addr, a.prefixlen)
                .map_err(|e| KeeperError::parse("interface addresses", e))
        })
        .collect()
}

/// Parses `ip -j -6 route show default` into the egress device, if any.
pub fn parse_default_route_dev(output: &str) -> KeeperResult<Option<String>> {
    let routes: Vec<RouteJson> = parse_json_array("default route", output)?;
    Ok(routes
        .into_iter()
        .filter(|r| r.dst == "default" || r.dst == "::/0")
        .find_map(|r| r.dev))
}

/// Parses `/proc/modules` into the set of loaded module names.
pub fn parse_proc_modules(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
