// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Local test nodes on ephemeral loopback ports.
#![allow(dead_code)]

use std::{net::IpAddr, sync::Arc, time::Duration};

use bitchat_core::{
    CHAT_CHANNEL, ChannelId, GossipConfig, GossipEngine, MemoryPeerDb, NodeConfig, Server,
    wire::ConfigMsg,
};

pub const CHAIN: &str = "itest";

pub fn gossip_config() -> GossipConfig {
    GossipConfig {
        fetch_retry_interval_ms: 0,
        fetch_poll_interval_ms: 10,
        pow_target_bits_per_kb: 0,
        handshake_timeout_secs: 5,
        accept_pacing_ms: 1,
        ..GossipConfig::default()
    }
}

pub fn node_config(gossip: GossipConfig) -> NodeConfig {
    NodeConfig {
        listen_ip: IpAddr::from([127, 0, 0, 1]),
        port: 0,
        chain: CHAIN.into(),
        gossip,
        ..NodeConfig::default()
    }
}

pub struct Node {
    pub server: Server,
    pub engine: Arc<GossipEngine>,
    pub addr: std::net::SocketAddr,
}

impl Node {
    pub async fn start(gossip: GossipConfig) -> Self {
        let server = Server::new(node_config(gossip.clone()), MemoryPeerDb::new());
        let engine = GossipEngine::start(server.clone(), gossip).await;
        engine.serve_channel(CHAT_CHANNEL).await;
        let addr = server.configure().await.expect("configure");
        Self {
            server,
            engine,
            addr,
        }
    }

    pub async fn stop(&self) {
        self.engine.shutdown().await;
        self.server.close().await;
    }
}

/// Handshake config for a hand-driven peer.
pub fn raw_config(channels: &[ChannelId]) -> ConfigMsg {
    ConfigMsg {
        supported_features: Default::default(),
        subscribed_channels: channels.iter().copied().collect(),
        public_contact: None,
        min_relay_fee: 0,
        chain: CHAIN.into(),
    }
}

pub async fn wait_for_connections(server: &Server, expected: usize) {
    for _ in 0..300 {
        if server.get_connections().await.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} connections, have {}",
        server.get_connections().await.len()
    );
}

pub async fn wait_for_channel_peers(server: &Server, channel: ChannelId, expected: usize) {
    for _ in 0..300 {
        if server.connections_for_channel(channel).await.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} connections on {channel}");
}
