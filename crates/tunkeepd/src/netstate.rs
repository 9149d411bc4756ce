//! Host network state access.
//!
//! [`NetworkState`] is the seam between the reconciliation logic and the
//! operating system: probing, kernel modules, the tunnel device, its IPv6
//! addresses and the IPv6 default route. [`IpRoute2`] implements it with
//! iproute2, ping and modprobe.

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};
use tunkeep_common::{shell, KeeperError, KeeperResult};

use crate::commands::*;
use crate::observe::{self, LinkState};
use crate::types::{Ipv6Prefix, TunnelEndpoints};

/// A mutating call against host network state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    LoadModule(String),
    AddTunnel(TunnelEndpoints),
    ChangeTunnel(TunnelEndpoints),
    SetLinkUp,
    FlushGlobalAddrs,
    AddAddr(Ipv6Prefix),
    FlushDefaultRoute,
    AddDefaultRoute,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::LoadModule(_) => "load-module",
            Mutation::AddTunnel(_) => "add-tunnel",
            Mutation::ChangeTunnel(_) => "change-tunnel",
            Mutation::SetLinkUp => "set-link-up",
            Mutation::FlushGlobalAddrs => "flush-global-addrs",
            Mutation::AddAddr(_) => "add-addr",
            Mutation::FlushDefaultRoute => "flush-default-route",
            Mutation::AddDefaultRoute => "add-default-route",
        }
    }
}

/// Operating-system capabilities the keeper depends on.
///
/// Queries return fresh state on every call; nothing is cached.
#[async_trait]
pub trait NetworkState: Send + Sync {
    /// Single round-trip probe. Any failure, including a tool error, is `false`.
    async fn probe(&self, target: IpAddr, timeout_secs: u64) -> bool;

    async fn is_module_loaded(&self, module: &str) -> KeeperResult<bool>;

    async fn load_module(&self, module: &str) -> KeeperResult<()>;

    /// `Ok(None)` when the interface does not exist.
    async fn link_state(&self, ifname: &str) -> KeeperResult<Option<LinkState>>;

    async fn add_tunnel(&self, ifname: &str, endpoints: &TunnelEndpoints) -> KeeperResult<()>;

    async fn change_tunnel(&self, ifname: &str, endpoints: &TunnelEndpoints)
        -> KeeperResult<()>;

    async fn set_link_up(&self, ifname: &str) -> KeeperResult<()>;

    async fn global_addrs(&self, ifname: &str) -> KeeperResult<Vec<Ipv6Prefix>>;

    async fn flush_global_addrs(&self, ifname: &str) -> KeeperResult<()>;

    async fn add_addr(&self, ifname: &str, prefix: &Ipv6Prefix) -> KeeperResult<()>;

    /// Egress device of the IPv6 default route, if one is installed.
    async fn default_route_dev(&self) -> KeeperResult<Option<String>>;

    async fn flush_default_route(&self) -> KeeperResult<()>;

    async fn add_default_route(&self, ifname: &str) -> KeeperResult<()>;
}

/// iproute2-backed [`NetworkState`].
#[derive(Debug, Clone, Default)]
pub struct IpRoute2 {
    /// Log mutating commands instead of running them.
    dry_run: bool,
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn mutate(&self, cmd: &str) -> KeeperResult<()> {
        if self.dry_run {
            info!(command = %cmd, "dry-run: not executing");
            return Ok(());
        }
        shell::exec_or_throw(cmd).await.map(|_| ())
    }
}

/// stderr of `ip` for a missing device.
fn is_missing_device(output: &str) -> bool {
    output.contains("does not exist") || output.contains("Cannot find device")
}

#[async_trait]
impl NetworkState for IpRoute2 {
    async fn probe(&self, target: IpAddr, timeout_secs: u64) -> bool {
        let cmd = build_ping_cmd(target, timeout_secs);
        match shell::exec(&cmd).await {
            Ok(result) => result.success(),
            Err(e) => {
                debug!(target = %target, error = %e, "Probe could not run");
                false
            }
        }
    }

    async fn is_module_loaded(&self, module: &str) -> KeeperResult<bool> {
        let content = tokio::fs::read_to_string(shell::PROC_MODULES)
            .await
            .map_err(|e| KeeperError::parse(shell::PROC_MODULES, e.to_string()))?;
        if observe::parse_proc_modules(&content).contains(module) {
            return Ok(true);
        }
        // Built-in modules only show up under /sys/module.
        let builtin = Path::new("/sys/module").join(module);
        Ok(tokio::fs::try_exists(builtin).await.unwrap_or(false))
    }

    async fn load_module(&self, module: &str) -> KeeperResult<()> {
        self.mutate(&build_modprobe_cmd(module)).await
    }

    async fn link_state(&self, ifname: &str) -> KeeperResult<Option<LinkState>> {
        let cmd = build_show_link_cmd(ifname);
        let result = shell::exec(&cmd).await?;
        if !result.success() && is_missing_device(&result.stderr) {
            return Ok(None);
        }
        let stdout = result.into_result(&cmd)?;
        observe::parse_link(&stdout).map(Some)
    }

    async fn add_tunnel(&self, ifname: &str, endpoints: &TunnelEndpoints) -> KeeperResult<()> {
        self.mutate(&build_add_tunnel_cmd(ifname, endpoints)).await
    }

    async fn change_tunnel(
        &self,
        ifname: &str,
        endpoints: &TunnelEndpoints,
    ) -> KeeperResult<()> {
        self.mutate(&build_change_tunnel_cmd(ifname, endpoints)).await
    }

    async fn set_link_up(&self, ifname: &str) -> KeeperResult<()> {
        self.mutate(&build_set_link_up_cmd(ifname)).await
    }

    async fn global_addrs(&self, ifname: &str) -> KeeperResult<Vec<Ipv6Prefix>> {
        let stdout = shell::exec_or_throw(&build_show_global_addr_cmd(ifname)).await?;
        observe::parse_global_addrs(&stdout)
    }

    async fn flush_global_addrs(&self, ifname: &str) -> KeeperResult<()> {
        self.mutate(&build_flush_global_addr_cmd(ifname)).await
    }

    async fn add_addr(&self, ifname: &str, prefix: &Ipv6Prefix) -> KeeperResult<()> {
        self.mutate(&build_add_addr_cmd(ifname, prefix)).await
    }

    async fn default_route_dev(&self) -> KeeperResult<Option<String>> {
        let stdout = shell::exec_or_throw(&build_show_default_route_cmd()).await?;
        observe::parse_default_route_dev(&stdout)
    }

    async fn flush_default_route(&self) -> KeeperResult<()> {
        self.mutate(&build_flush_default_route_cmd()).await
    }

    async fn add_default_route(&self, ifname: &str) -> KeeperResult<()> {
        self.mutate(&build_add_default_route_cmd(ifname)).await
    }
}
