//! Tunnel Keeper Daemon - IPv6-in-IPv4 (sit) tunnel supervisor
//!
//! tunkeepd keeps a provider-assigned 6in4 tunnel usable, handling:
//! - IPv6 and IPv4 reachability probing
//! - Kernel module loading (ipv6, sit)
//! - Tunnel device, address and default route reconciliation
//! - Tunnel broker endpoint updates when local repair is not enough
//! - Exponential backoff between failed repairs

pub mod backoff;
pub mod commands;
pub mod config;
pub mod keeper;
pub mod modules;
pub mod netstate;
pub mod observe;
pub mod reconcile;
pub mod types;
pub mod updater;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backoff::Backoff;
pub use config::{ConfigSource, FileConfigSource, KeeperFile, KeeperSettings};
pub use keeper::TunnelKeeper;
pub use netstate::{IpRoute2, NetworkState};
pub use reconcile::{reconcile_interface, ReconcileReport};
pub use types::{Outcome, TunnelConfig};
pub use updater::{EndpointUpdater, HttpUpdater};
