//! Partner discovery & standalone mode (spec §4.7): pairwise liveness
//! probing between two cooperating monitor instances, no consensus or
//! quorum. New relative to the teacher; outbound HTTP follows the same
//! `reqwest` usage as `prober.rs`.

use crate::types::{PartnerDiscoveryConfig, Registry};
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct PartnerClient {
    client: Client,
}

impl Default for PartnerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PartnerClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Probe the partner's liveness port at startup, if configured and not
    /// running standalone (spec §4.7 `discoverOnStartup`).
    ///
    /// Open Question resolution (DESIGN.md): when both `partnerInstanceId`
    /// and `partnerStatusUrl` are set, `partnerStatusUrl` wins, since a
    /// fully-qualified URL is unambiguous while an instance id still needs
    /// a lookup mechanism this system doesn't otherwise provide.
    pub async fn discover(&self, registry: &Registry) -> PartnerStatus {
        if registry.standalone_mode {
            return PartnerStatus::Standalone;
        }

        let Some(url) = self.resolve_probe_url(&registry.partner_discovery) else {
            return PartnerStatus::NotConfigured;
        };

        match self
            .client
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!(url, "partner discovered and reachable");
                PartnerStatus::Reachable
            }
            Ok(resp) => {
                warn!(url, status = %resp.status(), "partner responded with non-success status");
                PartnerStatus::Unreachable
            }
            Err(e) => {
                warn!(url, error = %e, "partner discovery request failed");
                PartnerStatus::Unreachable
            }
        }
    }

    fn resolve_probe_url(&self, config: &PartnerDiscoveryConfig) -> Option<String> {
        if !config.discover_on_startup {
            return None;
        }
        if let Some(url) = &config.partner_status_url {
            return Some(url.clone());
        }
        config
            .partner_liveness_port
            .map(|port| format!("http://127.0.0.1:{port}/health"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerStatus {
    Standalone,
    NotConfigured,
    Reachable,
    Unreachable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standalone_mode_short_circuits_discovery() {
        let client = PartnerClient::new();
        let registry = Registry::new("inst-1");
        let mut registry = registry;
        registry.standalone_mode = true;

        let status = client.discover(&registry).await;
        assert_eq!(status, PartnerStatus::Standalone);
    }

    #[tokio::test]
    async fn missing_partner_config_reports_not_configured() {
        let client = PartnerClient::new();
        let registry = Registry::new("inst-1");
        let status = client.discover(&registry).await;
        assert_eq!(status, PartnerStatus::NotConfigured);
    }
}
