//! In-memory collaborators for exercising the keeper without touching the host.
//!
//! [`FakeNetwork`] simulates the tunnel device, addresses and default route,
//! applies every mutation to that simulated state and records it, so a
//! second reconciliation against the same fake shows what is idempotent.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tunkeep_common::{KeeperError, KeeperResult};

use crate::netstate::{Mutation, NetworkState};
use crate::observe::LinkState;
use crate::types::{Credentials, Ipv6Prefix, TunnelConfig, TunnelEndpoints};
use crate::updater::{EndpointUpdater, DEFAULT_UPDATE_URL};

/// Configuration shared by the tests.
pub fn sample_config() -> TunnelConfig {
    TunnelConfig {
        interface: "he-ipv6".to_string(),
        server_ipv4: "203.0.113.1".parse().unwrap(),
        client_ipv4: "198.51.100.2".parse().unwrap(),
        server_ipv6: "2001:db8::1/64".parse().unwrap(),
        client_ipv6: "2001:db8::2/64".parse().unwrap(),
        kernel_modules: vec!["ipv6".to_string(), "sit".to_string()],
        credentials: Credentials {
            username: "user".to_string(),
            password: "secret".to_string(),
            tunnel_id: "123456".to_string(),
        },
        update_url: DEFAULT_UPDATE_URL.to_string(),
    }
}

/// Something the fake saw, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Probe(IpAddr),
    Query(&'static str),
    Mutate(Mutation),
}

#[derive(Debug, Default)]
struct FakeState {
    ipv6_probes: VecDeque<bool>,
    ipv4_probes: VecDeque<bool>,
    ipv6_default: bool,
    ipv4_default: bool,
    loaded_modules: HashSet<String>,
    unloadable_modules: HashSet<String>,
    link: Option<LinkState>,
    addrs: Vec<Ipv6Prefix>,
    default_dev: Option<String>,
    failing: HashSet<&'static str>,
    failing_queries: HashSet<&'static str>,
    calls: Vec<Call>,
}

/// Scriptable [`NetworkState`] double.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    state: Mutex<FakeState>,
}

impl FakeNetwork {
    /// A host with the modules loaded and no tunnel device.
    pub fn new() -> Self {
        let net = Self::default();
        {
            let mut s = net.lock();
            s.loaded_modules = ["ipv6", "sit"].iter().map(|m| m.to_string()).collect();
        }
        net
    }

    /// A host whose tunnel already matches `config` exactly.
    pub fn matching(config: &TunnelConfig) -> Self {
        let net = Self::new();
        {
            let mut s = net.lock();
            s.link = Some(LinkState {
                endpoints: Some(config.endpoints()),
                admin_up: true,
            });
            s.addrs = vec![config.client_ipv6];
            s.default_dev = Some(config.interface.clone());
        }
        net
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues IPv6 probe results; once drained, `set_ipv6_default` applies.
    pub fn push_ipv6_probes(&self, results: &[bool]) {
        self.lock().ipv6_probes.extend(results);
    }

    pub fn push_ipv4_probes(&self, results: &[bool]) {
        self.lock().ipv4_probes.extend(results);
    }

    pub fn set_ipv6_default(&self, reachable: bool) {
        self.lock().ipv6_default = reachable;
    }

    pub fn set_ipv4_default(&self, reachable: bool) {
        self.lock().ipv4_default = reachable;
    }

    pub fn set_link(&self, link: Option<LinkState>) {
        self.lock().link = link;
    }

    pub fn set_addrs(&self, addrs: Vec<Ipv6Prefix>) {
        self.lock().addrs = addrs;
    }

    pub fn set_default_dev(&self, dev: Option<&str>) {
        self.lock().default_dev = dev.map(str::to_string);
    }

    pub fn unload_module(&self, module: &str) {
        self.lock().loaded_modules.remove(module);
    }

    /// Makes `modprobe <module>` fail.
    pub fn make_module_unloadable(&self, module: &str) {
        let mut s = self.lock();
        s.loaded_modules.remove(module);
        s.unloadable_modules.insert(module.to_string());
    }

    /// Makes every mutation with this [`Mutation::name`] fail.
    pub fn fail_mutation(&self, name: &'static str) {
        self.lock().failing.insert(name);
    }

    /// Makes every query of this kind (`"module"`, `"link"`, `"addrs"`,
    /// `"default-route"`) fail as unparseable output.
    pub fn fail_query(&self, what: &'static str) {
        self.lock().failing_queries.insert(what);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Only the mutating calls, in order.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Mutate(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn probe_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Probe(_)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn link(&self) -> Option<LinkState> {
        self.lock().link.clone()
    }

    pub fn addrs(&self) -> Vec<Ipv6Prefix> {
        self.lock().addrs.clone()
    }

    pub fn default_dev(&self) -> Option<String> {
        self.lock().default_dev.clone()
    }

    fn query(&self, what: &'static str) -> KeeperResult<()> {
        let mut s = self.lock();
        s.calls.push(Call::Query(what));
        if s.failing_queries.contains(what) {
            return Err(KeeperError::parse(what, "expected value at line 1 column 1"));
        }
        Ok(())
    }

    /// Records `m`, then applies it unless it is scripted to fail.
    fn mutate(&self, m: Mutation, apply: impl FnOnce(&mut FakeState)) -> KeeperResult<()> {
        let mut s = self.lock();
        let name = m.name();
        s.calls.push(Call::Mutate(m));
        if s.failing.contains(name) {
            return Err(KeeperError::ShellCommandFailed {
                command: name.to_string(),
                exit_code: 2,
                output: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        apply(&mut s);
        Ok(())
    }
}

#[async_trait]
impl NetworkState for FakeNetwork {
    async fn probe(&self, target: IpAddr, _timeout_secs: u64) -> bool {
        let mut s = self.lock();
        s.calls.push(Call::Probe(target));
        if target.is_ipv6() {
            let default = s.ipv6_default;
            s.ipv6_probes.pop_front().unwrap_or(default)
        } else {
            let default = s.ipv4_default;
            s.ipv4_probes.pop_front().unwrap_or(default)
        }
    }

    async fn is_module_loaded(&self, module: &str) -> KeeperResult<bool> {
        self.query("module")?;
        Ok(self.lock().loaded_modules.contains(module))
    }

    async fn load_module(&self, module: &str) -> KeeperResult<()> {
        let unloadable = self.lock().unloadable_modules.contains(module);
        if unloadable {
            self.lock()
                .calls
                .push(Call::Mutate(Mutation::LoadModule(module.to_string())));
            return Err(KeeperError::ShellCommandFailed {
                command: format!("modprobe {}", module),
                exit_code: 1,
                output: format!("modprobe: FATAL: Module {} not found", module),
            });
        }
        let owned = module.to_string();
        self.mutate(Mutation::LoadModule(owned.clone()), |s| {
            s.loaded_modules.insert(owned);
        })
    }

    async fn link_state(&self, _ifname: &str) -> KeeperResult<Option<LinkState>> {
        self.query("link")?;
        Ok(self.lock().link.clone())
    }

    async fn add_tunnel(&self, _ifname: &str, endpoints: &TunnelEndpoints) -> KeeperResult<()> {
        let ep = *endpoints;
        self.mutate(Mutation::AddTunnel(ep), |s| {
            s.link = Some(LinkState {
                endpoints: Some(ep),
                admin_up: false,
            });
        })
    }

    async fn change_tunnel(
        &self,
        _ifname: &str,
        endpoints: &TunnelEndpoints,
    ) -> KeeperResult<()> {
        let ep = *endpoints;
        self.mutate(Mutation::ChangeTunnel(ep), |s| {
            if let Some(link) = s.link.as_mut() {
                link.endpoints = Some(ep);
            }
        })
    }

    async fn set_link_up(&self, _ifname: &str) -> KeeperResult<()> {
        self.mutate(Mutation::SetLinkUp, |s| {
            if let Some(link) = s.link.as_mut() {
                link.admin_up = true;
            }
        })
    }

    async fn global_addrs(&self, _ifname: &str) -> KeeperResult<Vec<Ipv6Prefix>> {
        self.query("addrs")?;
        Ok(self.lock().addrs.clone())
    }

    async fn flush_global_addrs(&self, _ifname: &str) -> KeeperResult<()> {
        self.mutate(Mutation::FlushGlobalAddrs, |s| s.addrs.clear())
    }

    async fn add_addr(&self, _ifname: &str, prefix: &Ipv6Prefix) -> KeeperResult<()> {
        let p = *prefix;
        self.mutate(Mutation::AddAddr(p), |s| s.addrs.push(p))
    }

    async fn default_route_dev(&self) -> KeeperResult<Option<String>> {
        self.query("default-route")?;
        Ok(self.lock().default_dev.clone())
    }

    async fn flush_default_route(&self) -> KeeperResult<()> {
        self.mutate(Mutation::FlushDefaultRoute, |s| s.default_dev = None)
    }

    async fn add_default_route(&self, ifname: &str) -> KeeperResult<()> {
        let dev = ifname.to_string();
        self.mutate(Mutation::AddDefaultRoute, |s| s.default_dev = Some(dev))
    }
}

/// [`EndpointUpdater`] double that counts calls and answers a fixed result.
#[derive(Debug)]
pub struct RecordingUpdater {
    calls: AtomicUsize,
    succeed: bool,
}

impl RecordingUpdater {
    pub fn new(succeed: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            succeed,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointUpdater for RecordingUpdater {
    async fn update(&self, _config: &TunnelConfig) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.succeed
    }
}
