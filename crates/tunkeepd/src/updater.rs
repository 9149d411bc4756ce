//! Control-plane endpoint updater.
//!
//! When local repair leaves IPv6 unreachable, the provider most likely still
//! has an old IPv4 address on record for this client. A single authenticated
//! GET tells it to take the source address of the request instead.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::{info, trace, warn};
use tunkeep_common::{KeeperError, KeeperResult};

use crate::types::TunnelConfig;

/// Default provider endpoint (Hurricane Electric tunnelbroker).
pub const DEFAULT_UPDATE_URL: &str = "https://ipv4.tunnelbroker.net/nic/update";

/// Query parameter carrying the tunnel identifier.
const TUNNEL_ID_PARAM: &str = "hostname";

/// Remote control-plane collaborator.
#[async_trait]
pub trait EndpointUpdater: Send + Sync {
    /// Returns true if the provider accepted the update.
    async fn update(&self, config: &TunnelConfig) -> bool;
}

/// Builds the update URL for a tunnel.
pub fn build_update_url(base: &str, tunnel_id: &str) -> KeeperResult<Url> {
    Url::parse_with_params(base, &[(TUNNEL_ID_PARAM, tunnel_id)])
        .map_err(|e| KeeperError::invalid_config("control_plane.update_url", e.to_string()))
}

/// HTTPS implementation of [`EndpointUpdater`].
#[derive(Debug, Clone)]
pub struct HttpUpdater {
    client: Client,
    dry_run: bool,
}

impl HttpUpdater {
    /// Creates an updater whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> KeeperResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tunkeepd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeeperError::http(e.to_string()))?;
        Ok(Self {
            client,
            dry_run: false,
        })
    }

    /// In dry-run mode the request is logged and reported as not sent.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn send(&self, config: &TunnelConfig) -> KeeperResult<()> {
        let creds = &config.credentials;
        let url = build_update_url(&config.update_url, &creds.tunnel_id)?;

        let response = self
            .client
            .get(url)
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await
            .map_err(|e| KeeperError::http(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        trace!(status = %status, body = %body.trim(), "Control-plane response");

        if !status.is_success() {
            return Err(KeeperError::http(format!("update rejected with {}", status)));
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointUpdater for HttpUpdater {
    async fn update(&self, config: &TunnelConfig) -> bool {
        if self.dry_run {
            info!(
                tunnel_id = %config.credentials.tunnel_id,
                url = %config.update_url,
                "dry-run: not sending control-plane update"
            );
            return false;
        }
        match self.send(config).await {
            Ok(()) => {
                info!(
                    tunnel_id = %config.credentials.tunnel_id,
                    "Control-plane endpoint update sent"
                );
                true
            }
            Err(e) => {
                warn!(
                    tunnel_id = %config.credentials.tunnel_id,
                    error = %e,
                    "Control-plane endpoint update failed"
                );
                false
            }
        }
    }
}
