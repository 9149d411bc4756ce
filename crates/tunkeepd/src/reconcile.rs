//! Interface reconciler
//!
//! Brings the tunnel device, its global IPv6 address and the IPv6 default
//! route in line with a [`TunnelConfig`]. Steps run strictly in order:
//!
//! 1. tunnel endpoints (create, or change in place)
//! 2. administrative state (up)
//! 3. global IPv6 address (flush stale, assign configured)
//! 4. IPv6 default route (flush foreign, install via tunnel)
//!
//! Each step re-queries live state and issues no mutation when it already
//! matches. A failed mutation is logged and the sequence continues, but a
//! step whose precondition is unmet is skipped: addressing needs an
//! existing, up interface and routing only follows addressing.

use tracing::{debug, info, warn};
use tunkeep_common::KeeperResult;

use crate::netstate::{Mutation, NetworkState};
use crate::types::{InterfaceObservation, TunnelConfig};

/// What one reconciliation pass saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// State observed before each step's mutations.
    pub observation: InterfaceObservation,
    /// Mutations that succeeded, in order.
    pub applied: Vec<Mutation>,
    /// Mutations that failed, in order.
    pub failed: Vec<Mutation>,
    /// Steps skipped because an earlier step left their precondition unmet.
    pub skipped: Vec<&'static str>,
}

impl ReconcileReport {
    /// True if nothing had to change.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.failed.is_empty()
    }
}

/// Runs the four reconciliation steps for `config.interface`.
pub struct InterfaceReconciler<'a> {
    net: &'a dyn NetworkState,
    config: &'a TunnelConfig,
    report: ReconcileReport,
}

impl<'a> InterfaceReconciler<'a> {
    pub fn new(net: &'a dyn NetworkState, config: &'a TunnelConfig) -> Self {
        Self {
            net,
            config,
            report: ReconcileReport::default(),
        }
    }

    /// Runs all steps and returns what happened.
    pub async fn run(mut self) -> ReconcileReport {
        self.ensure_tunnel().await;

        if !self.ensure_link_up().await {
            self.report.skipped.extend(["address", "default-route"]);
            return self.report;
        }

        self.ensure_address().await;
        self.ensure_default_route().await;
        self.report
    }

    fn ifname(&self) -> &str {
        &self.config.interface
    }

    fn apply(&mut self, mutation: Mutation, result: KeeperResult<()>) -> bool {
        match result {
            Ok(()) => {
                info!(interface = %self.ifname(), action = mutation.name(), "Applied");
                self.report.applied.push(mutation);
                true
            }
            Err(e) => {
                warn!(
                    interface = %self.ifname(),
                    action = mutation.name(),
                    error = %e,
                    "Reconciliation action failed"
                );
                self.report.failed.push(mutation);
                false
            }
        }
    }

    /// Step 1: tunnel device with the configured endpoints.
    async fn ensure_tunnel(&mut self) {
        let wanted = self.config.endpoints();
        let link = match self.net.link_state(self.ifname()).await {
            Ok(link) => link,
            Err(e) => {
                warn!(interface = %self.ifname(), error = %e, "Cannot query tunnel");
                return;
            }
        };
        self.report.observation.endpoints = link.as_ref().and_then(|l| l.endpoints);

        match link {
            None => {
                info!(
                    interface = %self.ifname(),
                    remote = %wanted.remote,
                    local = %wanted.local,
                    "Creating tunnel"
                );
                let result = self.net.add_tunnel(self.ifname(), &wanted).await;
                self.apply(Mutation::AddTunnel(wanted), result);
            }
            Some(l) if l.endpoints != Some(wanted) => {
                info!(
                    interface = %self.ifname(),
                    observed = ?l.endpoints,
                    remote = %wanted.remote,
                    local = %wanted.local,
                    "Updating tunnel endpoints"
                );
                let result = self.net.change_tunnel(self.ifname(), &wanted).await;
                self.apply(Mutation::ChangeTunnel(wanted), result);
            }
            Some(_) => debug!(interface = %self.ifname(), "Tunnel endpoints match"),
        }
    }

    /// Step 2: administrative state. Returns true if the link exists and is up.
    async fn ensure_link_up(&mut self) -> bool {
        let link = match self.net.link_state(self.ifname()).await {
            Ok(Some(link)) => link,
            Ok(None) => {
                warn!(interface = %self.ifname(), "Tunnel missing, skipping remaining steps");
                return false;
            }
            Err(e) => {
                warn!(interface = %self.ifname(), error = %e, "Cannot query link state");
                return false;
            }
        };
        self.report.observation.admin_up = Some(link.admin_up);

        if link.admin_up {
            debug!(interface = %self.ifname(), "Link is up");
            return true;
        }
        let result = self.net.set_link_up(self.ifname()).await;
        self.apply(Mutation::SetLinkUp, result)
    }

    /// Step 3: exactly the configured global IPv6 address.
    async fn ensure_address(&mut self) {
        let wanted = self.config.client_ipv6;
        // Unknown addresses are flushed so a stale one cannot stay beside the new one.
        let (current, must_flush) = match self.net.global_addrs(self.ifname()).await {
            Ok(addrs) => {
                let present = !addrs.is_empty();
                (addrs, present)
            }
            Err(e) => {
                warn!(interface = %self.ifname(), error = %e, "Cannot query addresses");
                (Vec::new(), true)
            }
        };
        self.report.observation.global_ipv6 = current.clone();

        if current == [wanted] {
            debug!(interface = %self.ifname(), address = %wanted, "Address matches");
            return;
        }

        if must_flush {
            let result = self.net.flush_global_addrs(self.ifname()).await;
            self.apply(Mutation::FlushGlobalAddrs, result);
        }
        let result = self.net.add_addr(self.ifname(), &wanted).await;
        self.apply(Mutation::AddAddr(wanted), result);
    }

    /// Step 4: IPv6 default route through the tunnel.
    async fn ensure_default_route(&mut self) {
        // An unreadable route table is flushed so the add cannot collide.
        let (current, must_flush) = match self.net.default_route_dev().await {
            Ok(dev) => {
                let present = dev.is_some();
                (dev, present)
            }
            Err(e) => {
                warn!(error = %e, "Cannot query IPv6 default route");
                (None, true)
            }
        };
        self.report.observation.default_route_dev = current.clone();

        if current.as_deref() == Some(self.ifname()) {
            debug!(interface = %self.ifname(), "Default route matches");
            return;
        }

        if must_flush {
            let result = self.net.flush_default_route().await;
            self.apply(Mutation::FlushDefaultRoute, result);
        }
        let result = self.net.add_default_route(self.ifname()).await;
        self.apply(Mutation::AddDefaultRoute, result);
    }
}

/// Convenience wrapper around [`InterfaceReconciler`].
pub async fn reconcile_interface(
    net: &dyn NetworkState,
    config: &TunnelConfig,
) -> ReconcileReport {
    InterfaceReconciler::new(net, config).run().await
}
