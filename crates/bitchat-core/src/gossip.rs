// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Inventory gossip: announce digests, fetch what is missing, serve what is
//! asked for.
//!
//! A digest moves through `unknown -> pending -> stored`, or is abandoned
//! once its fetch has been retried `fetch_retry_cap` times. The fetch
//! scheduler wakes on new pending entries and on a poll interval.

use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    channel::ChannelId,
    config::GossipConfig,
    connection::Connection,
    error::NodeError,
    ids::ContentId,
    inventory::InventoryStore,
    pow,
    registry::ChannelHandler,
    server::Server,
    wire::{DataMsg, GetDataMsg, GossipPayload, InventoryMsg, Message},
};

/// Receives every new content item accepted into an inventory.
#[async_trait]
pub trait ContentSink: Send + Sync {
    async fn on_content(&self, channel: ChannelId, id: ContentId, content: &[u8]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFetch {
    pub channel: ChannelId,
    pub insert_time: Instant,
    pub last_query: Option<Instant>,
    pub query_count: u32,
    pub notice_count: u32,
}

/// Per-connection counters kept in the connection's channel state.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub inventory_notices: AtomicU64,
    pub data_received: AtomicU64,
    pub items_served: AtomicU64,
}

#[derive(Default)]
struct GossipState {
    inventories: HashMap<ChannelId, InventoryStore>,
    pending: HashMap<ContentId, PendingFetch>,
}

pub struct GossipEngine {
    me: Weak<GossipEngine>,
    server: Server,
    config: GossipConfig,
    state: Mutex<GossipState>,
    sink: Mutex<Option<Arc<dyn ContentSink>>>,
    wake: Arc<Notify>,
    fetch_task: Mutex<Option<JoinHandle<()>>>,
}

impl GossipEngine {
    /// Create the engine and start its fetch scheduler. Channels are served
    /// once passed to [`GossipEngine::serve_channel`].
    pub async fn start(server: Server, config: GossipConfig) -> Arc<Self> {
        let engine = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            server,
            config,
            state: Mutex::new(GossipState::default()),
            sink: Mutex::new(None),
            wake: Arc::new(Notify::new()),
            fetch_task: Mutex::new(None),
        });
        let handle = tokio::spawn(fetch_loop(
            Arc::downgrade(&engine),
            Arc::clone(&engine.wake),
            engine.config.fetch_poll_interval(),
        ));
        *engine.fetch_task.lock().await = Some(handle);
        engine
    }

    pub async fn set_sink(&self, sink: Arc<dyn ContentSink>) {
        *self.sink.lock().await = Some(sink);
    }

    /// Create the channel's inventory and route its messages here.
    pub async fn serve_channel(self: &Arc<Self>, channel: ChannelId) {
        self.state
            .lock()
            .await
            .inventories
            .entry(channel)
            .or_insert_with(|| InventoryStore::new(self.config.inventory_window()));
        let handler: Arc<dyn ChannelHandler> = Arc::clone(self) as Arc<dyn ChannelHandler>;
        self.server.subscribe(channel, &handler).await;
    }

    /// Stop the fetch scheduler.
    pub async fn shutdown(&self) {
        let handle = self.fetch_task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Add locally produced content to a channel's inventory.
    pub async fn store_inventory(
        &self,
        channel: ChannelId,
        content: Vec<u8>,
    ) -> anyhow::Result<ContentId> {
        let id = ContentId::from_bytes(&content);
        let mut state = self.state.lock().await;
        let inventory = state
            .inventories
            .get_mut(&channel)
            .ok_or_else(|| NodeError::not_found("inventory", channel))?;
        inventory.insert(id, content);
        state.pending.remove(&id);
        Ok(id)
    }

    pub async fn contains(&self, channel: ChannelId, id: &ContentId) -> bool {
        self.state
            .lock()
            .await
            .inventories
            .get(&channel)
            .is_some_and(|inventory| inventory.contains(id))
    }

    pub async fn get(&self, channel: ChannelId, id: &ContentId) -> anyhow::Result<Vec<u8>> {
        self.state
            .lock()
            .await
            .inventories
            .get(&channel)
            .and_then(|inventory| inventory.get(id))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| NodeError::not_found("content", id).into())
    }

    pub async fn pending(&self, id: &ContentId) -> Option<PendingFetch> {
        self.state.lock().await.pending.get(id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Announce items new since the last broadcast to every subscribed
    /// connection, skipping digests a connection already knows. Returns the
    /// number of announcements sent.
    pub async fn broadcast_inventory(&self, channel: ChannelId) -> anyhow::Result<usize> {
        let fresh = {
            let mut state = self.state.lock().await;
            let inventory = state
                .inventories
                .get_mut(&channel)
                .ok_or_else(|| NodeError::not_found("inventory", channel))?;
            let evicted = inventory.evict_expired();
            if evicted > 0 {
                debug!(%channel, evicted, "evicted expired inventory");
            }
            inventory.take_new_since_watermark()
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        for con in self.server.connections_for_channel(channel).await {
            con.prune_known(self.config.inventory_window()).await;
            let mut unknown = BTreeSet::new();
            for id in &fresh {
                if !con.knows(id).await {
                    unknown.insert(*id);
                }
            }
            if unknown.is_empty() {
                continue;
            }
            for id in &unknown {
                con.set_knows(*id).await;
            }
            debug!(peer = %con.remote_endpoint(), %channel, items = unknown.len(), "announcing inventory");
            let message = Message::from_typed(channel, &InventoryMsg { items: unknown })?;
            sent += 1;
            tokio::spawn(async move {
                if let Err(err) = con.send(&message).await {
                    debug!(peer = %con.remote_endpoint(), error = %err, "inventory send failed");
                }
            });
        }
        Ok(sent)
    }

    async fn handle_inventory(
        &self,
        con: &Arc<Connection>,
        channel: ChannelId,
        items: BTreeSet<ContentId>,
    ) -> anyhow::Result<()> {
        for id in &items {
            con.set_knows(*id).await;
        }
        if let Ok(stats) = con.channel_state::<ChannelStats>(channel).await {
            stats.inventory_notices.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        let mut scheduled = 0usize;
        {
            let mut state = self.state.lock().await;
            let GossipState {
                inventories,
                pending,
            } = &mut *state;
            let Some(inventory) = inventories.get(&channel) else {
                return Ok(());
            };
            for id in items {
                if inventory.contains(&id) {
                    continue;
                }
                pending
                    .entry(id)
                    .and_modify(|fetch| fetch.notice_count += 1)
                    .or_insert_with(|| {
                        scheduled += 1;
                        PendingFetch {
                            channel,
                            insert_time: now,
                            last_query: None,
                            query_count: 0,
                            notice_count: 1,
                        }
                    });
            }
        }
        if scheduled > 0 {
            debug!(peer = %con.remote_endpoint(), %channel, scheduled, "scheduled fetches");
            self.wake.notify_one();
        }
        Ok(())
    }

    async fn handle_data(
        &self,
        con: &Arc<Connection>,
        channel: ChannelId,
        content: Vec<u8>,
    ) -> anyhow::Result<()> {
        let id = ContentId::from_bytes(&content);
        if !pow::meets_target(&id, self.config.pow_target_bits_per_kb, content.len()) {
            warn!(
                peer = %con.remote_endpoint(),
                %id,
                bits = id.leading_zero_bits(),
                required = pow::required_bits(self.config.pow_target_bits_per_kb, content.len()),
                "rejecting content below proof-of-work target"
            );
            anyhow::bail!(NodeError::violation(format!(
                "content {id} is below the proof-of-work target"
            )));
        }
        con.set_knows(id).await;
        if let Ok(stats) = con.channel_state::<ChannelStats>(channel).await {
            stats.data_received.fetch_add(1, Ordering::Relaxed);
        }

        let (was_pending, is_new) = {
            let mut state = self.state.lock().await;
            let was_pending = state.pending.remove(&id).is_some();
            let Some(inventory) = state.inventories.get_mut(&channel) else {
                return Ok(());
            };
            (was_pending, inventory.insert(id, content.clone()))
        };
        if !was_pending {
            warn!(peer = %con.remote_endpoint(), %id, "received unrequested data");
        }
        if !is_new {
            return Ok(());
        }
        debug!(peer = %con.remote_endpoint(), %channel, %id, "stored fetched content");

        if let Some(engine) = self.me.upgrade() {
            tokio::spawn(async move {
                if let Err(err) = engine.broadcast_inventory(channel).await {
                    debug!(%channel, error = %err, "re-announce failed");
                }
            });
        }
        let sink = self.sink.lock().await.clone();
        if let Some(sink) = sink {
            sink.on_content(channel, id, &content).await;
        }
        Ok(())
    }

    fn serve_get_data(&self, con: Arc<Connection>, channel: ChannelId, items: BTreeSet<ContentId>) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for id in items {
                let content = {
                    let state = engine.state.lock().await;
                    state
                        .inventories
                        .get(&channel)
                        .and_then(|inventory| inventory.get(&id))
                        .map(<[u8]>::to_vec)
                };
                let Some(content) = content else {
                    trace!(peer = %con.remote_endpoint(), %id, "requested content not held");
                    continue;
                };
                let message = match Message::from_typed(channel, &DataMsg { content }) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(%id, error = %err, "cannot encode data");
                        continue;
                    }
                };
                con.set_knows(id).await;
                if let Ok(stats) = con.channel_state::<ChannelStats>(channel).await {
                    stats.items_served.fetch_add(1, Ordering::Relaxed);
                }
                if let Err(err) = con.send(&message).await {
                    debug!(peer = %con.remote_endpoint(), error = %err, "data send failed");
                    return;
                }
            }
        });
    }

    /// One scheduler pass: abandon exhausted fetches, query a random holder
    /// for every fetch whose retry interval has elapsed.
    pub async fn poll_fetches(&self) {
        let now = Instant::now();
        let retry = self.config.fetch_retry_interval();
        let cap = self.config.fetch_retry_cap;
        let mut due = Vec::new();
        let mut abandoned = Vec::new();
        {
            let mut state = self.state.lock().await;
            for (id, fetch) in state.pending.iter_mut() {
                let idle = fetch
                    .last_query
                    .is_none_or(|last| now.saturating_duration_since(last) >= retry);
                if !idle {
                    continue;
                }
                if fetch.query_count > cap {
                    abandoned.push((*id, fetch.clone()));
                    continue;
                }
                fetch.query_count += 1;
                fetch.last_query = Some(now);
                due.push((*id, fetch.channel));
            }
            for (id, _) in &abandoned {
                state.pending.remove(id);
            }
        }
        for (id, fetch) in abandoned {
            warn!(
                %id,
                channel = %fetch.channel,
                queries = fetch.query_count,
                notices = fetch.notice_count,
                "abandoning fetch after retry cap"
            );
        }
        if due.is_empty() {
            return;
        }

        let mut by_channel: HashMap<ChannelId, Vec<Arc<Connection>>> = HashMap::new();
        let mut requests: HashMap<SocketAddr, (Arc<Connection>, ChannelId, BTreeSet<ContentId>)> =
            HashMap::new();
        for (id, channel) in due {
            if !by_channel.contains_key(&channel) {
                let connections = self.server.connections_for_channel(channel).await;
                by_channel.insert(channel, connections);
            }
            let mut holders = Vec::new();
            for con in by_channel.get(&channel).into_iter().flatten() {
                if con.knows(&id).await {
                    holders.push(Arc::clone(con));
                }
            }
            let Some(holder) = holders.choose(&mut rand::thread_rng()) else {
                debug!(%id, %channel, "no connection holds pending content");
                continue;
            };
            requests
                .entry(holder.remote_endpoint())
                .or_insert_with(|| (Arc::clone(holder), channel, BTreeSet::new()))
                .2
                .insert(id);
        }

        for (_, (con, channel, items)) in requests {
            debug!(peer = %con.remote_endpoint(), %channel, items = items.len(), "requesting data");
            let message = match Message::from_typed(channel, &GetDataMsg { items }) {
                Ok(message) => message,
                Err(err) => {
                    debug!(error = %err, "cannot encode get-data");
                    continue;
                }
            };
            tokio::spawn(async move {
                if let Err(err) = con.send(&message).await {
                    debug!(peer = %con.remote_endpoint(), error = %err, "get-data send failed");
                }
            });
        }
    }
}

impl Drop for GossipEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.fetch_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Holds only a weak reference between passes so dropping the engine ends it.
async fn fetch_loop(engine: Weak<GossipEngine>, wake: Arc<Notify>, poll: Duration) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        let Some(engine) = engine.upgrade() else {
            return;
        };
        engine.poll_fetches().await;
    }
}

#[async_trait]
impl ChannelHandler for GossipEngine {
    async fn on_message(
        &self,
        connection: &Arc<Connection>,
        message: Message,
    ) -> anyhow::Result<()> {
        let channel = message.channel;
        match GossipPayload::decode(&message)? {
            GossipPayload::Inventory(inventory) => {
                self.handle_inventory(connection, channel, inventory.items)
                    .await
            }
            GossipPayload::GetData(request) => {
                self.serve_get_data(Arc::clone(connection), channel, request.items);
                Ok(())
            }
            GossipPayload::Data(data) => self.handle_data(connection, channel, data.content).await,
        }
    }
}
