//! Keeper integration tests
//!
//! Drives TunnelKeeper end to end against the in-memory network and a
//! recording control-plane client.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use tunkeepd::config::StaticConfigSource;
use tunkeepd::netstate::Mutation;
use tunkeepd::testing::{sample_config, Call, FakeNetwork, RecordingUpdater};
use tunkeepd::types::TunnelEndpoints;
use tunkeepd::{FileConfigSource, KeeperSettings, Outcome, TunnelKeeper};

fn settings(daemon: bool) -> KeeperSettings {
    KeeperSettings {
        frequency_secs: 60,
        max_latency_secs: 2,
        max_backoff_secs: 3600,
        update_timeout_secs: 30,
        daemon,
    }
}

fn keeper(net: &Arc<FakeNetwork>, updater: &Arc<RecordingUpdater>, daemon: bool) -> TunnelKeeper {
    TunnelKeeper::new(
        net.clone(),
        updater.clone(),
        Box::new(StaticConfigSource(sample_config())),
        settings(daemon),
    )
    .expect("Failed to create keeper")
}

/// Healthy IPv6 never touches the host.
///
/// Scenario:
/// 1. Start from a backed-off keeper
/// 2. IPv6 probe succeeds
/// 3. Verify no mutation, no update, backoff back to 0
#[tokio::test]
async fn test_healthy_cycle_is_side_effect_free() {
    let net = Arc::new(FakeNetwork::new());
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(false));
    let mut k = keeper(&net, &updater, true);

    // Build up some backoff first.
    net.push_ipv6_probes(&[false, false, false, false]);
    k.run_cycle().await.unwrap();
    k.run_cycle().await.unwrap();
    assert_eq!(k.backoff_secs(), 120);

    net.clear_calls();
    net.set_ipv6_default(true);
    assert_eq!(k.run_cycle().await.unwrap(), Outcome::Healthy);
    assert!(net.mutations().is_empty());
    assert_eq!(k.backoff_secs(), 0);
}

/// IPv4 outage leaves everything alone and does not escalate.
///
/// Scenario:
/// 1. IPv6 and IPv4 probes fail for three cycles
/// 2. Verify only the two probes ran each cycle
/// 3. Verify backoff stays at the base frequency
#[tokio::test]
async fn test_ipv4_down_takes_no_action() {
    let net = Arc::new(FakeNetwork::new());
    net.unload_module("sit");
    let updater = Arc::new(RecordingUpdater::new(true));
    let mut k = keeper(&net, &updater, true);

    for _ in 0..3 {
        net.clear_calls();
        assert_eq!(k.run_cycle().await.unwrap(), Outcome::Ipv4Down);
        assert_eq!(
            net.calls(),
            vec![
                Call::Probe("2001:db8::1".parse().unwrap()),
                Call::Probe("203.0.113.1".parse().unwrap()),
            ]
        );
        assert_eq!(k.backoff_secs(), 60);
    }
    assert_eq!(updater.calls(), 0);
}

/// Flapping IPv4 only repairs while the outer path is up.
///
/// Scenario:
/// 1. IPv4 down, then up, then down again; IPv6 down throughout
/// 2. Verify only the middle cycle reaches the control plane
/// 3. Verify each IPv4 outage pins backoff back to the base frequency
#[tokio::test]
async fn test_ipv4_flap_repairs_only_when_up() {
    let net = Arc::new(FakeNetwork::matching(&sample_config()));
    net.push_ipv4_probes(&[false, true, false]);
    let updater = Arc::new(RecordingUpdater::new(true));
    let mut k = keeper(&net, &updater, true);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let outcome = k.run_cycle().await.unwrap();
        seen.push((outcome, k.backoff_secs()));
    }
    assert_eq!(
        seen,
        vec![
            (Outcome::Ipv4Down, 60),
            (Outcome::Ipv6DownRepairAttempted, 120),
            (Outcome::Ipv4Down, 60),
        ]
    );
    assert_eq!(updater.calls(), 1);
    assert!(net.mutations().is_empty());
}

/// Backoff doubles per failed repair up to the cap, and one healthy cycle resets it.
#[tokio::test]
async fn test_backoff_doubles_to_cap() {
    let net = Arc::new(FakeNetwork::matching(&sample_config()));
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(true));
    let mut k = keeper(&net, &updater, true);

    let mut seen = Vec::new();
    for _ in 0..8 {
        assert_eq!(
            k.run_cycle().await.unwrap(),
            Outcome::Ipv6DownRepairAttempted
        );
        seen.push(k.backoff_secs());
    }
    assert_eq!(seen, vec![60, 120, 240, 480, 960, 1920, 3600, 3600]);
    assert_eq!(updater.calls(), 8);

    net.set_ipv6_default(true);
    k.run_cycle().await.unwrap();
    assert_eq!(k.backoff_secs(), 0);
}

/// Absent interface is built from scratch and restores IPv6.
///
/// Scenario:
/// 1. IPv6 fails, IPv4 succeeds, no tunnel device
/// 2. Keeper creates the tunnel, brings it up, assigns the address and route
/// 3. Re-probe succeeds, outcome Healthy, backoff 0
#[tokio::test]
async fn test_absent_interface_is_repaired() {
    let net = Arc::new(FakeNetwork::new());
    net.push_ipv6_probes(&[false, true]);
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(true));
    let mut k = keeper(&net, &updater, true);

    assert_eq!(k.run_cycle().await.unwrap(), Outcome::Healthy);
    assert_eq!(
        net.mutations(),
        vec![
            Mutation::AddTunnel(TunnelEndpoints {
                remote: "203.0.113.1".parse().unwrap(),
                local: "198.51.100.2".parse().unwrap(),
            }),
            Mutation::SetLinkUp,
            Mutation::AddAddr("2001:db8::2/64".parse().unwrap()),
            Mutation::AddDefaultRoute,
        ]
    );
    assert_eq!(net.default_dev().as_deref(), Some("he-ipv6"));
    assert_eq!(updater.calls(), 0);
    assert_eq!(k.backoff_secs(), 0);
}

/// Matching interface with IPv6 still down escalates to the control plane once.
#[tokio::test]
async fn test_matching_interface_calls_updater_once() {
    let net = Arc::new(FakeNetwork::matching(&sample_config()));
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(true));
    let mut k = keeper(&net, &updater, true);

    assert_eq!(
        k.run_cycle().await.unwrap(),
        Outcome::Ipv6DownRepairAttempted
    );
    assert!(net.mutations().is_empty());
    assert_eq!(updater.calls(), 1);
    assert_eq!(net.probe_count(), 3);
}

/// Failed control-plane update is absorbed and retried next cycle.
#[tokio::test]
async fn test_failed_update_is_not_fatal() {
    let net = Arc::new(FakeNetwork::matching(&sample_config()));
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(false));
    let mut k = keeper(&net, &updater, true);

    assert_eq!(k.run_cycle().await.unwrap(), Outcome::Ipv6DownRepairFailed);
    assert_eq!(k.run_cycle().await.unwrap(), Outcome::Ipv6DownRepairFailed);
    assert_eq!(updater.calls(), 2);
}

/// Module load failure stops the keeper before any interface step.
#[tokio::test]
async fn test_module_failure_terminates() {
    let net = Arc::new(FakeNetwork::new());
    net.set_ipv4_default(true);
    net.make_module_unloadable("sit");
    let updater = Arc::new(RecordingUpdater::new(true));
    let k = keeper(&net, &updater, true);

    let err = assert_err!(k.run(CancellationToken::new()).await);
    assert!(err.is_fatal());
    assert_eq!(
        net.mutations(),
        vec![Mutation::LoadModule("sit".to_string())]
    );
    assert!(!net
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Query("link") | Call::Query("addrs"))));
    assert_eq!(updater.calls(), 0);
}

/// Single-shot mode runs one cycle and returns Ok whatever the outcome.
#[tokio::test]
async fn test_single_shot_ignores_outcome() {
    let net = Arc::new(FakeNetwork::matching(&sample_config()));
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(false));
    let k = keeper(&net, &updater, false);

    assert_ok!(k.run(CancellationToken::new()).await);
    assert_eq!(updater.calls(), 1);
    assert_eq!(net.probe_count(), 3);
}

/// Failed repairs stretch the sleep between cycles.
///
/// Scenario:
/// 1. Every cycle ends in a failed update
/// 2. Cycles start at t = 0, 60, 180, 420
/// 3. Cancel at t = 500 while the keeper sleeps
#[tokio::test(start_paused = true)]
async fn test_daemon_sleeps_for_backoff() {
    let net = Arc::new(FakeNetwork::matching(&sample_config()));
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(false));
    let k = keeper(&net, &updater, true);

    let token = CancellationToken::new();
    let handle = tokio::spawn(k.run(token.clone()));

    tokio::time::sleep(Duration::from_secs(500)).await;
    token.cancel();
    assert_ok!(handle.await.unwrap());

    assert_eq!(updater.calls(), 4);
}

/// Cancellation during a sleep returns promptly without another cycle.
#[tokio::test(start_paused = true)]
async fn test_cancel_during_sleep() {
    let net = Arc::new(FakeNetwork::new());
    net.set_ipv6_default(true);
    let updater = Arc::new(RecordingUpdater::new(true));
    let k = keeper(&net, &updater, true);

    let token = CancellationToken::new();
    let handle = tokio::spawn(k.run(token.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    assert_ok!(handle.await.unwrap());

    assert_eq!(net.probe_count(), 1);
}

/// Edited config file takes effect at the next repair.
#[tokio::test]
async fn test_config_file_reloaded_at_repair() {
    const CONFIG: &str = r#"
[tunnel]
interface = "he-ipv6"
server_ipv4 = "203.0.113.1"
client_ipv4 = "198.51.100.2"
server_ipv6 = "2001:db8::1/64"
client_ipv6 = "2001:db8::2/64"

[credentials]
username = "user"
password = "secret"
tunnel_id = "123456"
"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let net = Arc::new(FakeNetwork::matching(&sample_config()));
    net.set_ipv4_default(true);
    let updater = Arc::new(RecordingUpdater::new(true));
    let mut k = TunnelKeeper::new(
        net.clone(),
        updater,
        Box::new(FileConfigSource::new(file.path())),
        settings(true),
    )
    .unwrap();

    std::fs::write(file.path(), CONFIG.replace("198.51.100.2", "198.51.100.77")).unwrap();
    k.run_cycle().await.unwrap();

    assert_eq!(
        net.mutations(),
        vec![Mutation::ChangeTunnel(TunnelEndpoints {
            remote: "203.0.113.1".parse().unwrap(),
            local: "198.51.100.77".parse().unwrap(),
        })]
    );
}
