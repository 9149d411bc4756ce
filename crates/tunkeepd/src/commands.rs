//! Shell command builders for probes, modules and tunnel operations

use std::net::IpAddr;

use tunkeep_common::shell::{self, shellquote};

use crate::types::{Ipv6Prefix, TunnelEndpoints, TUNNEL_MODE_SIT, TUNNEL_TTL};

/// Build a single-echo reachability probe
///
/// `-W` bounds the wait for the reply; the address family picks `-4`/`-6`.
pub fn build_ping_cmd(target: IpAddr, timeout_secs: u64) -> String {
    let family = if target.is_ipv6() { "-6" } else { "-4" };
    format!(
        "{} {} -c 1 -W {} {}",
        shell::PING_CMD,
        family,
        timeout_secs.max(1),
        shellquote(&target.to_string())
    )
}

/// Build kernel module load command
pub fn build_modprobe_cmd(module: &str) -> String {
    format!("{} {}", shell::MODPROBE_CMD, shellquote(module))
}

/// Build detailed JSON link query (tunnel endpoints and flags)
pub fn build_show_link_cmd(ifname: &str) -> String {
    format!("{} -j -d link show dev {}", shell::IP_CMD, shellquote(ifname))
}

/// Build sit tunnel creation command
pub fn build_add_tunnel_cmd(ifname: &str, endpoints: &TunnelEndpoints) -> String {
    build_tunnel_cmd("add", ifname, endpoints)
}

/// Build in-place tunnel endpoint update command
///
/// `change` keeps the interface index, so addresses and routes on the
/// device survive.
pub fn build_change_tunnel_cmd(ifname: &str, endpoints: &TunnelEndpoints) -> String {
    build_tunnel_cmd("change", ifname, endpoints)
}

fn build_tunnel_cmd(verb: &str, ifname: &str, endpoints: &TunnelEndpoints) -> String {
    format!(
        "{} tunnel {} {} mode {} remote {} local {} ttl {}",
        shell::IP_CMD,
        verb,
        shellquote(ifname),
        TUNNEL_MODE_SIT,
        shellquote(&endpoints.remote.to_string()),
        shellquote(&endpoints.local.to_string()),
        TUNNEL_TTL
    )
}

/// Build tunnel interface bring-up command
pub fn build_set_link_up_cmd(ifname: &str) -> String {
    format!("{} link set dev {} up", shell::IP_CMD, shellquote(ifname))
}

/// Build JSON query for global-scope IPv6 addresses on the interface
pub fn build_show_global_addr_cmd(ifname: &str) -> String {
    format!(
        "{} -j -6 addr show dev {} scope global",
        shell::IP_CMD,
        shellquote(ifname)
    )
}

/// Build global-scope IPv6 address flush command
pub fn build_flush_global_addr_cmd(ifname: &str) -> String {
    format!(
        "{} -6 addr flush dev {} scope global",
        shell::IP_CMD,
        shellquote(ifname)
    )
}

/// Build IPv6 address assignment command
pub fn build_add_addr_cmd(ifname: &str, prefix: &Ipv6Prefix) -> String {
    format!(
        "{} -6 addr add {} dev {}",
        shell::IP_CMD,
        shellquote(&prefix.to_string()),
        shellquote(ifname)
    )
}

/// Build JSON query for the IPv6 default route
pub fn build_show_default_route_cmd() -> String {
    format!("{} -j -6 route show default", shell::IP_CMD)
}

/// Build IPv6 default route flush command
pub fn build_flush_default_route_cmd() -> String {
    format!("{} -6 route flush default", shell::IP_CMD)
}

/// Build IPv6 default route installation through the tunnel
pub fn build_add_default_route_cmd(ifname: &str) -> String {
    format!(
        "{} -6 route add default dev {}",
        shell::IP_CMD,
        shellquote(ifname)
    )
}
