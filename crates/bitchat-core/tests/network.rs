// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
mod common;

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bitchat_core::{
    CHAT_CHANNEL, ChannelHandler, Connection, ConnectionDelegate, ContentId, DisconnectReason,
    GossipConfig, MemoryPeerDb, Message, PEER_CHANNEL, Server, secure_handshake,
    wire::{GossipPayload, InventoryMsg, PeerPayload},
};
use common::{
    Node, gossip_config, node_config, raw_config, wait_for_channel_peers, wait_for_connections,
};
use tokio::{net::TcpStream, sync::mpsc};

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn fetch_moves_to_another_holder_after_advertiser_disconnects() {
    let b = Node::start(gossip_config()).await;
    // Drive the scheduler by hand.
    b.engine.shutdown().await;

    let content = b"held by c".to_vec();
    let id = ContentId::from_bytes(&content);

    let a = Connection::connect(b.addr, &raw_config(&[CHAT_CHANNEL]), &gossip_config())
        .await
        .expect("a dials b");
    let announce = Message::from_typed(
        CHAT_CHANNEL,
        &InventoryMsg {
            items: BTreeSet::from([id]),
        },
    )
    .expect("encode");
    a.send(&announce).await.expect("announce");
    let b_engine = &b.engine;
    wait_for("pending fetch", move || async move {
        b_engine.pending(&id).await.is_some()
    })
    .await;

    b.engine.poll_fetches().await;
    assert_eq!(b.engine.pending(&id).await.expect("pending").query_count, 1);

    // A never answers and goes away.
    a.close().await;
    drop(a);
    wait_for_connections(&b.server, 0).await;

    let c = Node::start(gossip_config()).await;
    c.engine
        .store_inventory(CHAT_CHANNEL, content.clone())
        .await
        .expect("store");
    c.server.connect_to(b.addr).await.expect("c dials b");
    wait_for_channel_peers(&c.server, CHAT_CHANNEL, 1).await;
    assert_eq!(
        c.engine.broadcast_inventory(CHAT_CHANNEL).await.expect("announce"),
        1
    );
    wait_for("second notice", move || async move {
        b_engine
            .pending(&id)
            .await
            .is_some_and(|fetch| fetch.notice_count == 2)
    })
    .await;

    b.engine.poll_fetches().await;
    wait_for("content from c", move || async move {
        b_engine.contains(CHAT_CHANNEL, &id).await
    })
    .await;
    assert!(b.engine.pending(&id).await.is_none());
    assert_eq!(
        b.engine.get(CHAT_CHANNEL, &id).await.expect("stored"),
        content
    );

    c.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn unanswered_fetch_is_bounded_by_retry_cap() {
    let gossip = gossip_config();
    let cap = gossip.fetch_retry_cap;
    let b = Node::start(gossip.clone()).await;
    b.engine.shutdown().await;

    let silent = Connection::connect(b.addr, &raw_config(&[CHAT_CHANNEL]), &gossip)
        .await
        .expect("dial");
    let id = ContentId::from_bytes(b"never served");
    silent
        .send(
            &Message::from_typed(
                CHAT_CHANNEL,
                &InventoryMsg {
                    items: BTreeSet::from([id]),
                },
            )
            .expect("encode"),
        )
        .await
        .expect("announce");
    let b_engine = &b.engine;
    wait_for("pending fetch", move || async move {
        b_engine.pending(&id).await.is_some()
    })
    .await;

    let mut queries = 0;
    while b.engine.pending(&id).await.is_some() {
        b.engine.poll_fetches().await;
        queries += 1;
        assert!(queries <= cap + 2, "fetch outlived its retry cap");
    }
    // cap + 1 queries, then one pass that abandons.
    assert_eq!(queries, cap + 2);
    assert!(!b.engine.contains(CHAT_CHANNEL, &id).await);

    silent.close().await;
    b.stop().await;
}

#[tokio::test]
async fn misaligned_frame_closes_only_the_offending_connection() {
    let b = Node::start(gossip_config()).await;
    let c = Node::start(gossip_config()).await;
    c.server.connect_to(b.addr).await.expect("c dials b");
    wait_for_connections(&b.server, 1).await;

    let stream = TcpStream::connect(b.addr).await.expect("tcp");
    let (mut reader, mut writer) =
        secure_handshake(Box::new(stream), true, gossip_config().max_frame_bytes)
            .await
            .expect("secure handshake");
    writer
        .send(&Message::from_typed(PEER_CHANNEL, &raw_config(&[CHAT_CHANNEL])).expect("encode"))
        .await
        .expect("send config");
    let first = reader.read_message().await.expect("remote config");
    assert!(matches!(
        PeerPayload::decode(&first).expect("decode"),
        PeerPayload::Config(_)
    ));
    wait_for_connections(&b.server, 2).await;

    let mut frame = 13u64.to_le_bytes().to_vec();
    frame.extend_from_slice(&[0u8; 13]);
    writer.write_frame(&frame).await.expect("write");

    let mut report = None;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .expect("b hangs up in time")
        {
            Ok(message) => {
                if let Ok(PeerPayload::ErrorReport(r)) = PeerPayload::decode(&message) {
                    report = Some(r);
                }
            }
            Err(_) => break,
        }
    }
    let report = report.expect("error report before close");
    assert!(report.message.contains("not a multiple of 8"));

    wait_for_connections(&b.server, 1).await;
    let content = b"still flowing".to_vec();
    let id = c
        .engine
        .store_inventory(CHAT_CHANNEL, content)
        .await
        .expect("store");
    c.engine.broadcast_inventory(CHAT_CHANNEL).await.expect("announce");
    let b_engine = &b.engine;
    wait_for("content over the surviving connection", move || async move {
        b_engine.contains(CHAT_CHANNEL, &id).await
    })
    .await;

    c.stop().await;
    b.stop().await;
}

struct Counter(AtomicUsize);

#[async_trait]
impl ChannelHandler for Counter {
    async fn on_message(&self, _connection: &Arc<Connection>, _message: Message) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn close_drops_connections_and_silences_handlers() {
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    let handler: Arc<dyn ChannelHandler> = counter.clone();
    let a = Server::new(node_config(gossip_config()), MemoryPeerDb::new());
    a.subscribe(CHAT_CHANNEL, &handler).await;
    let a_addr = a.configure().await.expect("configure a");

    let b = Server::new(node_config(gossip_config()), MemoryPeerDb::new());
    let b_handler: Arc<dyn ChannelHandler> = Arc::new(Counter(AtomicUsize::new(0)));
    b.subscribe(CHAT_CHANNEL, &b_handler).await;
    b.configure().await.expect("configure b");
    b.connect_to(a_addr).await.expect("dial");
    wait_for_connections(&a, 1).await;

    let ping = Message::new(CHAT_CHANNEL, vec![1, 0]);
    assert_eq!(b.broadcast(&ping).await.expect("broadcast"), 1);
    let delivered = &counter.0;
    wait_for("first delivery", move || async move {
        delivered.load(Ordering::SeqCst) == 1
    })
    .await;

    a.close().await;
    assert!(a.get_connections().await.is_empty());
    let seen = counter.0.load(Ordering::SeqCst);

    let _ = b.broadcast(&ping).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.0.load(Ordering::SeqCst), seen);
    assert!(a.connect_to(b.local_addr().expect("bound")).await.is_err());

    b.close().await;
}

struct InventoryTap(mpsc::UnboundedSender<BTreeSet<ContentId>>);

#[async_trait]
impl ConnectionDelegate for InventoryTap {
    async fn on_message(&self, _connection: &Arc<Connection>, message: Message) -> anyhow::Result<()> {
        if message.channel == CHAT_CHANNEL
            && let Ok(GossipPayload::Inventory(inventory)) = GossipPayload::decode(&message)
        {
            let _ = self.0.send(inventory.items);
        }
        Ok(())
    }

    async fn on_disconnected(&self, _connection: &Arc<Connection>, _reason: DisconnectReason) {}
}

#[tokio::test]
async fn announcements_never_repeat_known_digests() {
    let node = Node::start(gossip_config()).await;
    let observer = Connection::connect(node.addr, &raw_config(&[CHAT_CHANNEL]), &gossip_config())
        .await
        .expect("dial");
    let (tx, mut rx) = mpsc::unbounded_channel();
    observer.start(Arc::new(InventoryTap(tx))).await.expect("start");
    wait_for_channel_peers(&node.server, CHAT_CHANNEL, 1).await;
    let to_observer = node.server.connections_for_channel(CHAT_CHANNEL).await[0].clone();

    let known = node
        .engine
        .store_inventory(CHAT_CHANNEL, b"observer has this".to_vec())
        .await
        .expect("store");
    to_observer.set_knows(known).await;
    let fresh = node
        .engine
        .store_inventory(CHAT_CHANNEL, b"observer lacks this".to_vec())
        .await
        .expect("store");
    assert_eq!(node.engine.broadcast_inventory(CHAT_CHANNEL).await.expect("announce"), 1);

    let later = node
        .engine
        .store_inventory(CHAT_CHANNEL, b"stored later".to_vec())
        .await
        .expect("store");
    assert_eq!(node.engine.broadcast_inventory(CHAT_CHANNEL).await.expect("announce"), 1);
    assert_eq!(node.engine.broadcast_inventory(CHAT_CHANNEL).await.expect("announce"), 0);

    let mut announced = Vec::new();
    for _ in 0..2 {
        let items = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("inventory in time")
            .expect("inventory");
        announced.extend(items);
    }
    announced.sort();
    let mut expected = vec![fresh, later];
    expected.sort();
    assert_eq!(announced, expected);
    assert!(!announced.contains(&known));

    observer.close().await;
    node.stop().await;
}

#[tokio::test]
async fn content_below_work_target_warns_its_sender_once() {
    let a = Node::start(gossip_config()).await;
    let b = Node::start(GossipConfig {
        pow_target_bits_per_kb: 40,
        ..gossip_config()
    })
    .await;
    b.server.connect_to(a.addr).await.expect("b dials a");
    wait_for_channel_peers(&a.server, CHAT_CHANNEL, 1).await;

    a.engine
        .store_inventory(CHAT_CHANNEL, b"cheap".to_vec())
        .await
        .expect("a holds content");
    a.engine
        .broadcast_inventory(CHAT_CHANNEL)
        .await
        .expect("announce");

    let b_db = b.server.peer_db();
    let a_addr = a.addr;
    wait_for("b to drop a", move || async move {
        b_db.fetch(a_addr).await.is_ok_and(|record| !record.active)
    })
    .await;
    let record = b.server.peer_db().fetch(a.addr).await.expect("record");
    assert_eq!(record.warnings, 1);
    assert!(!b.engine.contains(CHAT_CHANNEL, &ContentId::from_bytes(b"cheap")).await);

    b.stop().await;
    a.stop().await;
}
