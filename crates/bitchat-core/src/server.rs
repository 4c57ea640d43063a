// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Peer server: accept loop, outbound connect rounds, the live-connection
//! indexes and the peer channel (configuration and peer exchange).
//!
//! Lock order: the server state lock is never held while awaiting a
//! connection's writer or read loop.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{ChannelId, PEER_CHANNEL},
    config::NodeConfig,
    connection::{Connection, ConnectionDelegate, DisconnectReason},
    error::NodeError,
    peer_db::{PeerDb, PeerRecord, now_unix_secs},
    registry::{ChannelHandler, ChannelRegistry},
    wire::{ConfigMsg, Host, KnownHostsMsg, Message, PeerPayload},
};

/// Upper bound on hosts sent in, or accepted from, one peer exchange.
pub const MAX_KNOWN_HOSTS: usize = 64;
pub const FEATURE_GOSSIP: &str = "gossip";

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: NodeConfig,
    peer_db: Arc<dyn PeerDb>,
    registry: ChannelRegistry,
    state: RwLock<ServerState>,
    tasks: Mutex<ServerTasks>,
    local_addr: OnceLock<SocketAddr>,
    connecting: AtomicBool,
    closed: AtomicBool,
}

#[derive(Default)]
struct ServerState {
    connections: HashMap<SocketAddr, Arc<Connection>>,
    by_channel: HashMap<ChannelId, HashSet<SocketAddr>>,
}

#[derive(Default)]
struct ServerTasks {
    accept: Option<JoinHandle<()>>,
    connect: Option<JoinHandle<()>>,
    handshakes: JoinSet<()>,
}

impl Server {
    pub fn new(config: NodeConfig, peer_db: Arc<dyn PeerDb>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                peer_db,
                registry: ChannelRegistry::new(),
                state: RwLock::new(ServerState::default()),
                tasks: Mutex::new(ServerTasks::default()),
                local_addr: OnceLock::new(),
                connecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn peer_db(&self) -> &Arc<dyn PeerDb> {
        &self.inner.peer_db
    }

    /// Address the accept loop is bound to, once configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Clear stale active flags, seed the peer database with the bootstrap
    /// endpoints, bind the listen port and start accepting.
    pub async fn configure(&self) -> anyhow::Result<SocketAddr> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            anyhow::bail!(NodeError::ConnectionClosed);
        }
        if inner.local_addr.get().is_some() {
            anyhow::bail!("server already configured");
        }
        let stale = inner.peer_db.reset_active().await?;
        if stale > 0 {
            debug!(peers = stale, "cleared stale active flags");
        }
        for endpoint in inner.config.bootstrap_addrs()? {
            if inner.config.is_blacklisted(&endpoint) {
                continue;
            }
            match inner.peer_db.fetch(endpoint).await {
                Ok(_) => {}
                Err(err) if NodeError::is_not_found(&err) => {
                    inner.peer_db.store(PeerRecord::new(endpoint)).await?;
                }
                Err(err) => return Err(err),
            }
        }

        let listener = TcpListener::bind(inner.config.listen_addr()).await?;
        let local = listener.local_addr()?;
        let _ = inner.local_addr.set(local);
        info!(addr = %local, chain = %inner.config.chain, "listening");

        let accept = tokio::spawn(Arc::clone(inner).accept_loop(listener));
        inner.tasks.lock().await.accept = Some(accept);
        Ok(local)
    }

    pub async fn subscribe(&self, channel: ChannelId, handler: &Arc<dyn ChannelHandler>) {
        self.inner.registry.subscribe(channel, handler).await;
    }

    pub async fn unsubscribe(&self, channel: ChannelId) -> bool {
        self.inner.registry.unsubscribe(channel).await
    }

    /// Start an outbound round filling up to `desired` outbound connections.
    /// Does nothing while a previous round is still running.
    pub async fn connect_to_peers(&self, desired: usize) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || inner.connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let round = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            round.connect_round(desired).await;
            round.connecting.store(false, Ordering::SeqCst);
        });
        inner.tasks.lock().await.connect = Some(handle);
    }

    /// Wait for the current outbound round, if any, to finish.
    pub async fn wait_for_connect_round(&self) {
        let handle = self.inner.tasks.lock().await.connect.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Dial one specific endpoint, bypassing the peer database selection.
    pub async fn connect_to(&self, endpoint: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        self.inner.dial(endpoint).await
    }

    /// Encode `message` once and send it to every connection whose remote is
    /// subscribed to its channel. Sends run as independent tasks.
    pub async fn broadcast(&self, message: &Message) -> anyhow::Result<usize> {
        let frame = Arc::new(message.encode_frame(self.inner.config.gossip.max_frame_bytes)?);
        let targets = if message.channel == PEER_CHANNEL {
            self.get_connections().await
        } else {
            self.connections_for_channel(message.channel).await
        };
        for con in &targets {
            let con = Arc::clone(con);
            let frame = Arc::clone(&frame);
            tokio::spawn(async move {
                if let Err(err) = con.send_frame(&frame).await {
                    debug!(peer = %con.remote_endpoint(), error = %err, "broadcast send failed");
                }
            });
        }
        Ok(targets.len())
    }

    pub async fn get_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = self
            .inner
            .state
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect::<Vec<_>>();
        connections.sort_by_key(|con| con.remote_endpoint());
        connections
    }

    /// Live connections whose remote subscribed to `channel`.
    pub async fn connections_for_channel(&self, channel: ChannelId) -> Vec<Arc<Connection>> {
        let state = self.inner.state.read().await;
        let Some(endpoints) = state.by_channel.get(&channel) else {
            return Vec::new();
        };
        endpoints
            .iter()
            .filter_map(|endpoint| state.connections.get(endpoint).cloned())
            .collect()
    }

    pub async fn outbound_count(&self) -> usize {
        self.inner.outbound_count().await
    }

    /// Stop accepting and dialling, close every connection and wait for all
    /// read loops to finish. No delegate callback fires after this returns.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        let (accept, connect, mut handshakes) = {
            let mut tasks = inner.tasks.lock().await;
            (
                tasks.accept.take(),
                tasks.connect.take(),
                std::mem::take(&mut tasks.handshakes),
            )
        };
        for handle in [accept, connect].into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        handshakes.shutdown().await;

        let connections = {
            let mut state = inner.state.write().await;
            state.by_channel.clear();
            state
                .connections
                .drain()
                .map(|(_, con)| con)
                .collect::<Vec<_>>()
        };
        let count = connections.len();
        for con in connections {
            con.close().await;
        }
        inner.connecting.store(false, Ordering::SeqCst);
        info!(connections = count, "server closed");
    }
}

/// The peer-database key for a connection: the dialled address for
/// outbound connections, the advertised contact for inbound ones.
fn peer_key(con: &Connection) -> Option<SocketAddr> {
    if con.is_outbound() {
        Some(con.remote_endpoint())
    } else {
        con.remote_config().public_contact
    }
}

impl ServerInner {
    async fn local_config(&self) -> ConfigMsg {
        ConfigMsg {
            supported_features: [FEATURE_GOSSIP.to_string()].into_iter().collect(),
            subscribed_channels: self.registry.channels().await,
            public_contact: self.config.public_endpoint,
            min_relay_fee: self.config.min_relay_fee,
            chain: self.config.chain.clone(),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if self.config.is_blacklisted(&addr) {
                        debug!(peer = %addr, "refusing blacklisted peer");
                    } else {
                        let inner = Arc::clone(&self);
                        let mut tasks = self.tasks.lock().await;
                        while tasks.handshakes.try_join_next().is_some() {}
                        tasks
                            .handshakes
                            .spawn(async move { inner.complete_inbound(stream, addr).await });
                    }
                }
                Err(err) => error!(error = %err, "accept failed"),
            }
            tokio::time::sleep(self.config.gossip.accept_pacing()).await;
        }
    }

    async fn complete_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let local = self.local_config().await;
        match Connection::accept(stream, addr, &local, &self.config.gossip).await {
            Ok(con) => {
                if let Err(err) = self.register(con).await {
                    debug!(peer = %addr, error = %err, "inbound registration failed");
                }
            }
            Err(err) => debug!(peer = %addr, error = %err, "inbound handshake failed"),
        }
    }

    async fn outbound_count(&self) -> usize {
        self.state
            .read()
            .await
            .connections
            .values()
            .filter(|con| con.is_outbound())
            .count()
    }

    async fn is_connected(&self, endpoint: SocketAddr) -> bool {
        let state = self.state.read().await;
        state.connections.contains_key(&endpoint)
            || state
                .connections
                .values()
                .any(|con| con.server_endpoint() == endpoint)
    }

    async fn connect_round(self: &Arc<Self>, desired: usize) {
        let mut tried = HashSet::new();
        let budget = match self.peer_db.inactive_count().await {
            Ok(count) => count.saturating_mul(4).max(4),
            Err(err) => {
                warn!(error = %err, "peer database unavailable");
                return;
            }
        };
        let mut picks = 0;
        while self.outbound_count().await < desired && picks < budget {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            picks += 1;
            match self.connect_random_peer(&mut tried).await {
                Ok(_) => {}
                Err(err) if NodeError::is_not_found(&err) => break,
                Err(err) => debug!(error = %err, "outbound attempt failed"),
            }
        }
        let outbound = self.outbound_count().await;
        debug!(outbound, desired, "connect round finished");
    }

    /// Pick one random inactive peer and dial it. `Ok(None)` when the pick
    /// was unusable (already tried, connected, blacklisted or ourselves).
    async fn connect_random_peer(
        self: &Arc<Self>,
        tried: &mut HashSet<SocketAddr>,
    ) -> anyhow::Result<Option<SocketAddr>> {
        let record = self.peer_db.get_random_inactive().await?;
        let target = record.dial_endpoint();
        if !tried.insert(target)
            || self.config.is_blacklisted(&target)
            || self.local_addr.get() == Some(&target)
            || self.is_connected(target).await
        {
            return Ok(None);
        }
        match self.dial(target).await {
            Ok(_) => Ok(Some(target)),
            Err(err) => {
                warn!(peer = %target, error = %err, "outbound connect failed");
                Err(err)
            }
        }
    }

    async fn dial(self: &Arc<Self>, target: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let local = self.local_config().await;
        let con = Connection::connect(target, &local, &self.config.gossip).await?;
        self.register(Arc::clone(&con)).await?;
        self.send_known_hosts(&con).await;
        Ok(con)
    }

    /// Index a handshaken connection, start its read loop and record it in
    /// the peer database.
    async fn register(self: &Arc<Self>, con: Arc<Connection>) -> anyhow::Result<()> {
        let endpoint = con.remote_endpoint();
        {
            let mut state = self.state.write().await;
            if self.closed.load(Ordering::SeqCst) {
                drop(state);
                con.close().await;
                anyhow::bail!(NodeError::ConnectionClosed);
            }
            if state.connections.contains_key(&endpoint) {
                drop(state);
                con.close().await;
                anyhow::bail!("already connected to {endpoint}");
            }
            state.connections.insert(endpoint, Arc::clone(&con));
            for channel in &con.remote_config().subscribed_channels {
                state.by_channel.entry(*channel).or_default().insert(endpoint);
            }
            let delegate = Arc::new(ServerDelegate {
                inner: Arc::downgrade(self),
            });
            con.start(delegate).await?;
        }
        info!(
            peer = %endpoint,
            outbound = con.is_outbound(),
            channels = con.remote_config().subscribed_channels.len(),
            "connection established"
        );
        self.record_connected(&con).await;
        Ok(())
    }

    async fn record_connected(&self, con: &Connection) {
        let Some(key) = peer_key(con) else {
            return;
        };
        let mut record = match self.peer_db.fetch(key).await {
            Ok(record) => record,
            Err(err) if NodeError::is_not_found(&err) => PeerRecord::new(key),
            Err(err) => {
                warn!(peer = %key, error = %err, "peer lookup failed");
                return;
            }
        };
        let remote = con.remote_config();
        record.server_endpoint = remote.public_contact.filter(|contact| *contact != key);
        record.channels = remote.subscribed_channels.clone();
        record.features = remote.supported_features.clone();
        record.last_com_unix = now_unix_secs();
        record.active = true;
        if let Err(err) = self.peer_db.store(record).await {
            warn!(peer = %key, error = %err, "failed to store peer");
        }
    }

    /// Count one abuse warning against the peer behind `con`. Called once per
    /// protocol violation, when the offending connection is torn down.
    async fn record_warning(&self, con: &Connection) {
        let Some(key) = peer_key(con) else {
            return;
        };
        match self.peer_db.record_warning(key).await {
            Ok(count) => debug!(peer = %key, warnings = count, "peer warned"),
            Err(err) if NodeError::is_not_found(&err) => {}
            Err(err) => warn!(peer = %key, error = %err, "failed to record peer warning"),
        }
    }

    async fn record_disconnected(&self, con: &Connection) {
        let Some(key) = peer_key(con) else {
            return;
        };
        let Ok(mut record) = self.peer_db.fetch(key).await else {
            return;
        };
        record.active = false;
        record.last_com_unix = now_unix_secs();
        record.bytes_sent = record.bytes_sent.saturating_add(con.bytes_sent());
        record.bytes_recv = record.bytes_recv.saturating_add(con.bytes_recv());
        if let Err(err) = self.peer_db.store(record).await {
            warn!(peer = %key, error = %err, "failed to store peer");
        }
    }

    async fn remove_connection(&self, con: &Arc<Connection>) {
        let endpoint = con.remote_endpoint();
        let mut state = self.state.write().await;
        let is_current = state
            .connections
            .get(&endpoint)
            .is_some_and(|existing| Arc::ptr_eq(existing, con));
        if !is_current {
            return;
        }
        state.connections.remove(&endpoint);
        state.by_channel.retain(|_, endpoints| {
            endpoints.remove(&endpoint);
            !endpoints.is_empty()
        });
    }

    async fn send_known_hosts(&self, con: &Connection) {
        let records = match self.peer_db.all_records().await {
            Ok(records) => records,
            Err(err) => {
                debug!(error = %err, "cannot list peers for exchange");
                return;
            }
        };
        let target = con.remote_endpoint();
        let mut hosts = records
            .into_iter()
            .filter(|record| record.active && record.dial_endpoint() != target)
            .map(|record| Host {
                endpoint: record.dial_endpoint(),
                last_com_unix: record.last_com_unix,
            })
            .collect::<Vec<_>>();
        hosts.shuffle(&mut rand::thread_rng());
        hosts.truncate(MAX_KNOWN_HOSTS);
        if hosts.is_empty() {
            return;
        }
        let count = hosts.len();
        let sent = match Message::from_typed(PEER_CHANNEL, &KnownHostsMsg { hosts }) {
            Ok(message) => con.send(&message).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(()) => debug!(peer = %target, hosts = count, "sent known hosts"),
            Err(err) => debug!(peer = %target, error = %err, "known hosts send failed"),
        }
    }

    async fn merge_known_hosts(&self, from: SocketAddr, hosts: Vec<Host>) -> anyhow::Result<()> {
        let mut added = 0usize;
        for host in hosts.into_iter().take(MAX_KNOWN_HOSTS) {
            if self.config.is_blacklisted(&host.endpoint)
                || self.local_addr.get() == Some(&host.endpoint)
            {
                continue;
            }
            match self.peer_db.fetch(host.endpoint).await {
                Ok(_) => {}
                Err(err) if NodeError::is_not_found(&err) => {
                    let mut record = PeerRecord::new(host.endpoint);
                    record.last_com_unix = host.last_com_unix;
                    self.peer_db.store(record).await?;
                    added += 1;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(peer = %from, added, "merged known hosts");
        Ok(())
    }

    async fn handle_peer_message(
        &self,
        con: &Arc<Connection>,
        message: Message,
    ) -> anyhow::Result<()> {
        match PeerPayload::decode(&message)? {
            PeerPayload::Config(_) => {
                anyhow::bail!(NodeError::violation("repeated config after handshake"))
            }
            PeerPayload::KnownHosts(known) => {
                self.merge_known_hosts(con.remote_endpoint(), known.hosts)
                    .await
            }
            PeerPayload::ErrorReport(report) => {
                warn!(
                    peer = %con.remote_endpoint(),
                    code = report.code,
                    message = %report.message,
                    "peer reported an error"
                );
                Ok(())
            }
        }
    }
}

/// Connection callbacks routed back into the server without keeping it alive.
struct ServerDelegate {
    inner: Weak<ServerInner>,
}

#[async_trait]
impl ConnectionDelegate for ServerDelegate {
    async fn on_message(
        &self,
        connection: &Arc<Connection>,
        message: Message,
    ) -> anyhow::Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        if message.channel == PEER_CHANNEL {
            inner.handle_peer_message(connection, message).await
        } else {
            inner.registry.dispatch(connection, message).await
        }
    }

    async fn on_disconnected(&self, connection: &Arc<Connection>, reason: DisconnectReason) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.remove_connection(connection).await;
        if matches!(reason, DisconnectReason::ProtocolViolation(_)) {
            inner.record_warning(connection).await;
        }
        inner.record_disconnected(connection).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::CHAT_CHANNEL,
        config::GossipConfig,
        peer_db::{MemoryPeerDb, SqlitePeerDb},
    };
    use std::{net::IpAddr, time::Duration};

    fn test_config() -> NodeConfig {
        NodeConfig {
            listen_ip: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            chain: "test".into(),
            gossip: GossipConfig {
                accept_pacing_ms: 1,
                handshake_timeout_secs: 5,
                ..GossipConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    struct Sink;

    #[async_trait]
    impl ChannelHandler for Sink {
        async fn on_message(
            &self,
            _connection: &Arc<Connection>,
            _message: Message,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn wait_for_connections(server: &Server, expected: usize) {
        for _ in 0..200 {
            if server.get_connections().await.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} connections");
    }

    #[tokio::test]
    async fn bootstrap_peers_are_seeded_and_dialled() {
        let a = Server::new(test_config(), MemoryPeerDb::new());
        let sink: Arc<dyn ChannelHandler> = Arc::new(Sink);
        a.subscribe(CHAT_CHANNEL, &sink).await;
        let a_addr = a.configure().await.expect("configure a");

        let mut b_config = test_config();
        b_config.bootstrap_endpoints = vec![a_addr.to_string()];
        let b = Server::new(b_config, MemoryPeerDb::new());
        b.configure().await.expect("configure b");
        assert_eq!(b.peer_db().inactive_count().await.expect("count"), 1);

        b.connect_to_peers(4).await;
        b.wait_for_connect_round().await;
        assert_eq!(b.outbound_count().await, 1);
        assert_eq!(b.connections_for_channel(CHAT_CHANNEL).await.len(), 1);
        let record = b.peer_db().fetch(a_addr).await.expect("record");
        assert!(record.active);
        assert!(record.channels.contains(&CHAT_CHANNEL));

        wait_for_connections(&a, 1).await;

        b.close().await;
        a.close().await;
        assert!(a.get_connections().await.is_empty());
        assert!(b.get_connections().await.is_empty());
    }

    #[tokio::test]
    async fn restart_redials_peers_left_marked_active() {
        let a = Server::new(test_config(), MemoryPeerDb::new());
        let a_addr = a.configure().await.expect("configure a");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.db");
        {
            let db = SqlitePeerDb::open(&path).expect("open");
            let mut record = PeerRecord::new(a_addr);
            record.active = true;
            db.store(record).await.expect("store");
        }

        let mut b_config = test_config();
        b_config.bootstrap_endpoints = vec![a_addr.to_string()];
        let b = Server::new(b_config, SqlitePeerDb::open(&path).expect("reopen"));
        b.configure().await.expect("configure b");
        assert_eq!(b.peer_db().inactive_count().await.expect("count"), 1);

        b.connect_to_peers(4).await;
        b.wait_for_connect_round().await;
        assert_eq!(b.outbound_count().await, 1);

        b.close().await;
        a.close().await;
    }

    #[tokio::test]
    async fn connect_round_is_not_reentrant() {
        let server = Server::new(test_config(), MemoryPeerDb::new());
        server.configure().await.expect("configure");
        server
            .peer_db()
            .store(PeerRecord::new("127.0.0.1:9".parse().expect("addr")))
            .await
            .expect("store");
        server.connect_to_peers(1).await;
        server.connect_to_peers(1).await;
        server.wait_for_connect_round().await;
        assert_eq!(server.outbound_count().await, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn disconnect_removes_connection_from_indexes() {
        let a = Server::new(test_config(), MemoryPeerDb::new());
        let sink: Arc<dyn ChannelHandler> = Arc::new(Sink);
        a.subscribe(CHAT_CHANNEL, &sink).await;
        let a_addr = a.configure().await.expect("configure a");
        let b = Server::new(test_config(), MemoryPeerDb::new());
        b.configure().await.expect("configure b");

        let con = b.connect_to(a_addr).await.expect("dial");
        assert_eq!(b.connections_for_channel(CHAT_CHANNEL).await.len(), 1);
        wait_for_connections(&a, 1).await;

        a.close().await;
        wait_for_connections(&b, 0).await;
        assert!(b.connections_for_channel(CHAT_CHANNEL).await.is_empty());
        assert!(con.is_closed().await);
        let record = b.peer_db().fetch(a_addr).await.expect("record");
        assert!(!record.active);
        b.close().await;
    }

    #[tokio::test]
    async fn known_hosts_are_merged_into_peer_db() {
        let a = Server::new(test_config(), MemoryPeerDb::new());
        let a_addr = a.configure().await.expect("configure a");
        let b_db = MemoryPeerDb::new();
        let gossiped: SocketAddr = "127.0.0.1:4444".parse().expect("addr");
        let mut known = PeerRecord::new(gossiped);
        known.active = true;
        b_db.store(known).await.expect("store");
        let b = Server::new(test_config(), b_db);
        b.configure().await.expect("configure b");

        b.connect_to(a_addr).await.expect("dial");
        let mut merged = None;
        for _ in 0..200 {
            if let Ok(record) = a.peer_db().fetch(gossiped).await {
                merged = Some(record);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = merged.expect("known host merged");
        assert!(!record.active);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribed_peers() {
        let a = Server::new(test_config(), MemoryPeerDb::new());
        let a_addr = a.configure().await.expect("configure a");
        let b = Server::new(test_config(), MemoryPeerDb::new());
        b.configure().await.expect("configure b");
        b.connect_to(a_addr).await.expect("dial");

        let sent = b
            .broadcast(&Message::new(CHAT_CHANNEL, vec![1, 0]))
            .await
            .expect("broadcast");
        assert_eq!(sent, 0, "a never subscribed to chat");
        assert_eq!(b.get_connections().await.len(), 1);

        a.close().await;
        b.close().await;
    }
}
