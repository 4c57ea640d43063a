// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::pow;

pub const DEFAULT_SERVER_PORT: u16 = 9876;
pub const DESIRED_PEER_COUNT: usize = 8;
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;
pub const INVENTORY_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_ip: IpAddr,
    pub port: u16,
    /// Network tag; peers on a different chain are refused during the handshake.
    pub chain: String,
    pub bootstrap_endpoints: Vec<String>,
    /// IPs (`10.0.0.1`) or endpoints (`10.0.0.1:9876`) never dialled nor accepted.
    pub blacklist: Vec<String>,
    pub desired_peer_count: usize,
    pub use_upnp: bool,
    /// Endpoint advertised to peers in the handshake, if reachable.
    pub public_endpoint: Option<SocketAddr>,
    pub min_relay_fee: u64,
    pub gossip: GossipConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_SERVER_PORT,
            chain: "bitchat".to_string(),
            bootstrap_endpoints: vec![],
            blacklist: vec![],
            desired_peer_count: DESIRED_PEER_COUNT,
            use_upnp: false,
            public_endpoint: None,
            min_relay_fee: 0,
            gossip: GossipConfig::default(),
        }
    }
}

/// Timing and admission parameters of the inventory protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub inventory_window_secs: u64,
    pub fetch_retry_interval_ms: u64,
    pub fetch_retry_cap: u32,
    pub fetch_poll_interval_ms: u64,
    pub max_frame_bytes: usize,
    pub pow_target_bits_per_kb: u32,
    pub handshake_timeout_secs: u64,
    pub accept_pacing_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            inventory_window_secs: INVENTORY_WINDOW_SECS,
            fetch_retry_interval_ms: 5_000,
            fetch_retry_cap: 3,
            fetch_poll_interval_ms: 50,
            max_frame_bytes: MAX_MESSAGE_SIZE,
            pow_target_bits_per_kb: 10,
            handshake_timeout_secs: 10,
            accept_pacing_ms: 30,
        }
    }
}

impl GossipConfig {
    pub fn inventory_window(&self) -> Duration {
        Duration::from_secs(self.inventory_window_secs)
    }

    pub fn fetch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_interval_ms)
    }

    pub fn fetch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_poll_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn accept_pacing(&self) -> Duration {
        Duration::from_millis(self.accept_pacing_ms)
    }
}

impl NodeConfig {
    /// Read `path`, writing the default configuration first if it is missing.
    pub fn load_or_create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let default = Self::default();
            std::fs::write(path, serde_json::to_string_pretty(&default)?)
                .with_context(|| format!("writing default config to {}", path.display()))?;
            return Ok(default);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bootstrap_addrs()?;
        if self.gossip.max_frame_bytes < 16 {
            anyhow::bail!("gossip.max_frame_bytes must be at least 16");
        }
        if self.gossip.pow_target_bits_per_kb > pow::MAX_TARGET_BITS_PER_KB {
            anyhow::bail!(
                "gossip.pow_target_bits_per_kb must be at most {}",
                pow::MAX_TARGET_BITS_PER_KB
            );
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    pub fn bootstrap_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.bootstrap_endpoints
            .iter()
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .with_context(|| format!("invalid bootstrap endpoint '{raw}'"))
            })
            .collect()
    }

    pub fn is_blacklisted(&self, addr: &SocketAddr) -> bool {
        self.blacklist.iter().any(|entry| {
            if let Ok(ep) = entry.parse::<SocketAddr>() {
                return ep == *addr;
            }
            entry
                .parse::<IpAddr>()
                .map(|ip| ip == addr.ip())
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let created = NodeConfig::load_or_create(&path).expect("create");
        assert_eq!(created.port, DEFAULT_SERVER_PORT);
        assert!(path.exists());

        let reloaded = NodeConfig::load_or_create(&path).expect("reload");
        assert_eq!(reloaded.desired_peer_count, DESIRED_PEER_COUNT);
        assert_eq!(reloaded.gossip.fetch_retry_cap, 3);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "port": 7100, "bootstrap_endpoints": ["127.0.0.1:7101"], "gossip": { "fetch_retry_cap": 5 } }"#,
        )
        .expect("write");
        let config = NodeConfig::load_or_create(&path).expect("load");
        assert_eq!(config.port, 7100);
        assert_eq!(config.gossip.fetch_retry_cap, 5);
        assert_eq!(config.gossip.inventory_window_secs, INVENTORY_WINDOW_SECS);
        assert_eq!(config.bootstrap_addrs().expect("addrs").len(), 1);
    }

    #[test]
    fn rejects_bad_bootstrap_endpoint() {
        let config = NodeConfig {
            bootstrap_endpoints: vec!["not-an-endpoint".into()],
            ..NodeConfig::default()
        };
        let err = config.validate().expect_err("must reject");
        assert!(err.to_string().contains("invalid bootstrap endpoint"));
    }

    #[test]
    fn rejects_unmineable_work_target() {
        let mut config = NodeConfig::default();
        config.gossip.pow_target_bits_per_kb = 246;
        let err = config.validate().expect_err("must reject");
        assert!(err.to_string().contains("pow_target_bits_per_kb"));
        config.gossip.pow_target_bits_per_kb = pow::MAX_TARGET_BITS_PER_KB;
        config.validate().expect("at the limit");
    }

    #[test]
    fn blacklist_matches_ip_or_endpoint() {
        let config = NodeConfig {
            blacklist: vec!["10.0.0.1".into(), "10.0.0.2:9000".into()],
            ..NodeConfig::default()
        };
        assert!(config.is_blacklisted(&"10.0.0.1:1234".parse().expect("addr")));
        assert!(config.is_blacklisted(&"10.0.0.2:9000".parse().expect("addr")));
        assert!(!config.is_blacklisted(&"10.0.0.2:9001".parse().expect("addr")));
    }
}
