//! Tunnel Keeper - reconciliation state machine and run loop
//!
//! One cycle walks the phases below and ends in an [`Outcome`]:
//!
//! ```text
//! Probing ──ok──────────────────────────────────────────► Healthy
//!    │ fail
//! ProbingIpv4 ──fail───────────────────────────────────► Ipv4Down
//!    │ ok
//! LocalRepair (reload config, modules, interface) ──► ReprobeIpv6 ──ok──► Healthy
//!                                                        │ fail
//!                                                   RemoteRepair ──► RepairAttempted / RepairFailed
//! ```
//!
//! Cycles never overlap. Shutdown is honoured before a cycle starts and
//! while sleeping between cycles, never in the middle of a repair.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tunkeep_common::KeeperResult;

use crate::backoff::Backoff;
use crate::config::{ConfigSource, KeeperSettings};
use crate::modules::ensure_modules;
use crate::netstate::NetworkState;
use crate::reconcile::reconcile_interface;
use crate::types::{Outcome, TunnelConfig};
use crate::updater::EndpointUpdater;

/// Position within a reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probing,
    ProbingIpv4,
    LocalRepair,
    ReprobeIpv6,
    RemoteRepair,
}

/// Tunnel Keeper
///
/// Owns the reconciler state (backoff, last outcome) and the current
/// configuration snapshot for the life of the process.
pub struct TunnelKeeper {
    net: Arc<dyn NetworkState>,
    updater: Arc<dyn EndpointUpdater>,
    source: Box<dyn ConfigSource>,
    settings: KeeperSettings,

    /// Snapshot used by the cycle in flight.
    config: TunnelConfig,

    backoff: Backoff,
    last_outcome: Option<Outcome>,
}

impl TunnelKeeper {
    /// Creates a keeper; the initial configuration load must succeed.
    pub fn new(
        net: Arc<dyn NetworkState>,
        updater: Arc<dyn EndpointUpdater>,
        source: Box<dyn ConfigSource>,
        settings: KeeperSettings,
    ) -> KeeperResult<Self> {
        settings.validate()?;
        let config = source.load()?;
        info!(
            interface = %config.interface,
            server_ipv4 = %config.server_ipv4,
            server_ipv6 = %config.server_ipv6,
            "TunnelKeeper initialized"
        );

        Ok(Self {
            net,
            updater,
            source,
            backoff: Backoff::new(settings.frequency_secs, settings.max_backoff_secs),
            settings,
            config,
            last_outcome: None,
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn backoff_secs(&self) -> u64 {
        self.backoff.current_secs()
    }

    pub fn last_outcome(&self) -> Option<Outcome> {
        self.last_outcome
    }

    async fn probe_ipv6(&self) -> bool {
        let target = self.config.ipv6_probe_target();
        let ok = self.net.probe(target, self.settings.max_latency_secs).await;
        debug!(target = %target, reachable = ok, "IPv6 probe");
        ok
    }

    async fn probe_ipv4(&self) -> bool {
        let target = self.config.ipv4_probe_target();
        let ok = self.net.probe(target, self.settings.max_latency_secs).await;
        debug!(target = %target, reachable = ok, "IPv4 probe");
        ok
    }

    /// Swaps in a fresh configuration; keeps the old one if loading fails.
    fn reload_config(&mut self) {
        match self.source.load() {
            Ok(config) => {
                if config != self.config {
                    info!(interface = %config.interface, "Configuration reloaded with changes");
                }
                self.config = config;
            }
            Err(e) => warn!(error = %e, "Configuration reload failed, keeping previous"),
        }
    }

    /// Runs one reconciliation cycle.
    ///
    /// Only a kernel module load failure is returned as an error.
    pub async fn run_cycle(&mut self) -> KeeperResult<Outcome> {
        let mut phase = Phase::Probing;

        let outcome = loop {
            trace!(phase = ?phase, "Cycle phase");
            phase = match phase {
                Phase::Probing => {
                    if self.probe_ipv6().await {
                        break Outcome::Healthy;
                    }
                    Phase::ProbingIpv4
                }
                Phase::ProbingIpv4 => {
                    if !self.probe_ipv4().await {
                        break Outcome::Ipv4Down;
                    }
                    Phase::LocalRepair
                }
                Phase::LocalRepair => {
                    self.reload_config();
                    info!(interface = %self.config.interface, "IPv6 unreachable, repairing tunnel");
                    ensure_modules(self.net.as_ref(), &self.config.kernel_modules).await?;
                    let report = reconcile_interface(self.net.as_ref(), &self.config).await;
                    debug!(
                        observation = ?report.observation,
                        applied = report.applied.len(),
                        failed = report.failed.len(),
                        skipped = ?report.skipped,
                        "Local repair finished"
                    );
                    Phase::ReprobeIpv6
                }
                Phase::ReprobeIpv6 => {
                    if self.probe_ipv6().await {
                        info!(interface = %self.config.interface, "IPv6 restored by local repair");
                        break Outcome::Healthy;
                    }
                    Phase::RemoteRepair
                }
                Phase::RemoteRepair => {
                    info!(
                        tunnel_id = %self.config.credentials.tunnel_id,
                        "IPv6 still unreachable, updating control-plane endpoint"
                    );
                    if self.updater.update(&self.config).await {
                        break Outcome::Ipv6DownRepairAttempted;
                    }
                    break Outcome::Ipv6DownRepairFailed;
                }
            };
        };

        self.backoff.record(outcome);
        self.log_outcome(outcome);
        self.last_outcome = Some(outcome);
        Ok(outcome)
    }

    fn log_outcome(&self, outcome: Outcome) {
        let changed = self.last_outcome != Some(outcome);
        let backoff_secs = self.backoff.current_secs();
        match outcome {
            Outcome::Healthy if changed => info!(outcome = %outcome, "Tunnel healthy"),
            Outcome::Healthy => debug!(outcome = %outcome, "Tunnel healthy"),
            Outcome::Ipv4Down => warn!(
                outcome = %outcome,
                server_ipv4 = %self.config.server_ipv4,
                "IPv4 path to tunnel server down, waiting"
            ),
            Outcome::Ipv6DownRepairAttempted | Outcome::Ipv6DownRepairFailed => warn!(
                outcome = %outcome,
                backoff_secs,
                "Tunnel still unhealthy"
            ),
        }
    }

    /// Runs cycles until `shutdown` is cancelled.
    ///
    /// In single-shot mode exactly one cycle runs and `Ok` is returned
    /// whatever its outcome.
    pub async fn run(mut self, shutdown: CancellationToken) -> KeeperResult<()> {
        info!(
            daemon = self.settings.daemon,
            frequency_secs = self.settings.frequency_secs,
            max_backoff_secs = self.settings.max_backoff_secs,
            "Starting reconciliation loop"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested");
                return Ok(());
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Fatal error, stopping");
                return Err(e);
            }

            if !self.settings.daemon {
                return Ok(());
            }

            let delay = self.backoff.next_delay();
            trace!(delay_secs = delay.as_secs(), "Sleeping until next cycle");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigSource;
    use crate::netstate::Mutation;
    use crate::testing::{sample_config, Call, FakeNetwork, RecordingUpdater};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tunkeep_common::KeeperError;

    fn settings() -> KeeperSettings {
        KeeperSettings {
            frequency_secs: 10,
            max_latency_secs: 1,
            max_backoff_secs: 80,
            update_timeout_secs: 5,
            daemon: true,
        }
    }

    fn keeper(
        net: &Arc<FakeNetwork>,
        updater: &Arc<RecordingUpdater>,
        settings: KeeperSettings,
    ) -> TunnelKeeper {
        TunnelKeeper::new(
            net.clone(),
            updater.clone(),
            Box::new(StaticConfigSource(sample_config())),
            settings,
        )
        .unwrap()
    }

    /// Hands out queued results, then repeats the last good config.
    struct SequenceSource {
        queue: Mutex<VecDeque<KeeperResult<TunnelConfig>>>,
        loads: Mutex<usize>,
    }

    impl SequenceSource {
        fn new(items: Vec<KeeperResult<TunnelConfig>>) -> Self {
            Self {
                queue: Mutex::new(items.into()),
                loads: Mutex::new(0),
            }
        }
    }

    impl ConfigSource for SequenceSource {
        fn load(&self) -> KeeperResult<TunnelConfig> {
            *self.loads.lock().unwrap() += 1;
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(sample_config()))
        }
    }

    #[tokio::test]
    async fn test_healthy_cycle_probes_once() {
        let net = Arc::new(FakeNetwork::new());
        net.set_ipv6_default(true);
        let updater = Arc::new(RecordingUpdater::new(true));
        let mut k = keeper(&net, &updater, settings());

        assert_eq!(k.run_cycle().await.unwrap(), Outcome::Healthy);
        assert_eq!(net.calls(), vec![Call::Probe("2001:db8::1".parse().unwrap())]);
        assert_eq!(k.last_outcome(), Some(Outcome::Healthy));
    }

    #[tokio::test]
    async fn test_ipv4_down_touches_nothing() {
        let net = Arc::new(FakeNetwork::new());
        net.unload_module("sit");
        let updater = Arc::new(RecordingUpdater::new(true));
        let mut k = keeper(&net, &updater, settings());

        assert_eq!(k.run_cycle().await.unwrap(), Outcome::Ipv4Down);
        assert_eq!(
            net.calls(),
            vec![
                Call::Probe("2001:db8::1".parse().unwrap()),
                Call::Probe("203.0.113.1".parse().unwrap()),
            ]
        );
        assert_eq!(updater.calls(), 0);
        assert_eq!(k.backoff_secs(), 10);
    }

    #[tokio::test]
    async fn test_local_repair_restores() {
        let net = Arc::new(FakeNetwork::new());
        net.push_ipv6_probes(&[false, true]);
        net.set_ipv4_default(true);
        let updater = Arc::new(RecordingUpdater::new(true));
        let mut k = keeper(&net, &updater, settings());

        assert_eq!(k.run_cycle().await.unwrap(), Outcome::Healthy);
        assert_eq!(updater.calls(), 0);
        assert_eq!(k.backoff_secs(), 0);
        assert_eq!(net.mutations().len(), 4);
    }

    #[tokio::test]
    async fn test_remote_repair_outcomes() {
        let net = Arc::new(FakeNetwork::matching(&sample_config()));
        net.set_ipv4_default(true);

        let ok = Arc::new(RecordingUpdater::new(true));
        let mut k = keeper(&net, &ok, settings());
        assert_eq!(k.run_cycle().await.unwrap(), Outcome::Ipv6DownRepairAttempted);
        assert_eq!(ok.calls(), 1);

        let failing = Arc::new(RecordingUpdater::new(false));
        let mut k = keeper(&net, &failing, settings());
        assert_eq!(k.run_cycle().await.unwrap(), Outcome::Ipv6DownRepairFailed);
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn test_backoff_escalates_then_resets() {
        let net = Arc::new(FakeNetwork::matching(&sample_config()));
        net.set_ipv4_default(true);
        let updater = Arc::new(RecordingUpdater::new(false));
        let mut k = keeper(&net, &updater, settings());

        let mut seen = Vec::new();
        for _ in 0..5 {
            k.run_cycle().await.unwrap();
            seen.push(k.backoff_secs());
        }
        assert_eq!(seen, vec![10, 20, 40, 80, 80]);

        net.set_ipv6_default(true);
        k.run_cycle().await.unwrap();
        assert_eq!(k.backoff_secs(), 0);
    }

    #[tokio::test]
    async fn test_module_failure_is_fatal_before_reconcile() {
        let net = Arc::new(FakeNetwork::new());
        net.set_ipv4_default(true);
        net.make_module_unloadable("sit");
        let updater = Arc::new(RecordingUpdater::new(true));
        let mut k = keeper(&net, &updater, settings());

        let err = k.run_cycle().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!net.calls().contains(&Call::Query("link")));
        assert_eq!(net.mutations(), vec![Mutation::LoadModule("sit".to_string())]);
        assert_eq!(updater.calls(), 0);
    }

    #[tokio::test]
    async fn test_config_reloaded_only_before_repair() {
        let mut changed = sample_config();
        changed.client_ipv4 = "198.51.100.9".parse().unwrap();
        let source = SequenceSource::new(vec![Ok(sample_config()), Ok(changed.clone())]);

        let net = Arc::new(FakeNetwork::new());
        net.set_ipv6_default(true);
        let updater = Arc::new(RecordingUpdater::new(true));
        let mut k = TunnelKeeper::new(net.clone(), updater, Box::new(source), settings()).unwrap();

        // Healthy cycle: no reload.
        k.run_cycle().await.unwrap();
        assert_eq!(k.config().client_ipv4, sample_config().client_ipv4);

        // Repair cycle picks up the new file.
        net.push_ipv6_probes(&[false, true]);
        net.set_ipv4_default(true);
        k.run_cycle().await.unwrap();
        assert_eq!(k.config(), &changed);
        assert!(net
            .mutations()
            .contains(&Mutation::AddTunnel(changed.endpoints())));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous() {
        let source = SequenceSource::new(vec![
            Ok(sample_config()),
            Err(KeeperError::config_load("/etc/tunkeep/tunkeep.toml", "truncated")),
        ]);
        let net = Arc::new(FakeNetwork::matching(&sample_config()));
        net.set_ipv4_default(true);
        let updater = Arc::new(RecordingUpdater::new(true));
        let mut k = TunnelKeeper::new(net.clone(), updater, Box::new(source), settings()).unwrap();

        assert_eq!(k.run_cycle().await.unwrap(), Outcome::Ipv6DownRepairAttempted);
        assert_eq!(k.config(), &sample_config());
    }

    #[test]
    fn test_initial_load_failure() {
        let source = SequenceSource::new(vec![Err(KeeperError::config_load("x", "missing"))]);
        let result = TunnelKeeper::new(
            Arc::new(FakeNetwork::new()),
            Arc::new(RecordingUpdater::new(true)),
            Box::new(source),
            settings(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_single_shot_runs_one_cycle() {
        let net = Arc::new(FakeNetwork::new());
        let updater = Arc::new(RecordingUpdater::new(true));
        let mut s = settings();
        s.daemon = false;
        let k = keeper(&net, &updater, s);

        k.run(CancellationToken::new()).await.unwrap();
        // IPv4 down: two probes, then exit.
        assert_eq!(net.probe_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_sleeps_frequency_between_healthy_cycles() {
        let net = Arc::new(FakeNetwork::new());
        net.set_ipv6_default(true);
        let updater = Arc::new(RecordingUpdater::new(true));
        let k = keeper(&net, &updater, settings());

        let token = CancellationToken::new();
        let handle = tokio::spawn(k.run(token.clone()));

        // Cycles at t = 0, 10, 20, 30.
        tokio::time::sleep(Duration::from_secs(35)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(net.probe_count(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let net = Arc::new(FakeNetwork::new());
        let updater = Arc::new(RecordingUpdater::new(true));
        let k = keeper(&net, &updater, settings());

        let token = CancellationToken::new();
        token.cancel();
        k.run(token).await.unwrap();
        assert_eq!(net.probe_count(), 0);
    }
}
