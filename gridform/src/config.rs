//! Engine configuration.

use std::ops::Range;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Tunables for one reconciliation run.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per remote call, single-deployment reconciler.
    pub deployment_call_timeout_secs: u64,
    /// Per remote call, network reconciler.
    pub network_call_timeout_secs: u64,
    /// Wall-clock budget for completion polling.
    pub completion_budget_secs: u64,
    /// Fixed delay between two agent fetches while polling.
    pub poll_interval_ms: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Retry cap for listen port sampling.
    pub port_attempts: u32,
    /// PersistentKeepalive of the access configuration.
    pub keepalive_secs: u32,
    /// Overlay (WireGuard) address space.
    pub overlay_range: Ipv4Net,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deployment_call_timeout_secs: 30,
            network_call_timeout_secs: 80,
            completion_budget_secs: 240,
            poll_interval_ms: 1000,
            port_range_start: 2000,
            port_range_end: 8000,
            port_attempts: 512,
            keepalive_secs: 25,
            overlay_range: Ipv4Net::new(std::net::Ipv4Addr::new(100, 64, 0, 0), 16)
                .unwrap_or_default(),
        }
    }
}

impl EngineConfig {
    pub fn deployment_call_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_call_timeout_secs)
    }

    pub fn network_call_timeout(&self) -> Duration {
        Duration::from_secs(self.network_call_timeout_secs)
    }

    pub fn completion_budget(&self) -> Duration {
        Duration::from_secs(self.completion_budget_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.deployment_call_timeout(), Duration::from_secs(30));
        assert_eq!(config.network_call_timeout(), Duration::from_secs(80));
        assert_eq!(config.completion_budget(), Duration::from_secs(240));
        assert_eq!(config.port_range(), 2000..8000);
        assert_eq!(config.overlay_range.to_string(), "100.64.0.0/16");
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 50, "completion_budget_secs": 10}"#)
                .unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.completion_budget(), Duration::from_secs(10));
        assert_eq!(config.port_attempts, 512);
        assert_eq!(config.keepalive_secs, 25);
    }
}
