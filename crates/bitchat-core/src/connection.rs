// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! One live peer connection: configuration handshake, serialized writes and
//! a read loop that hands every decoded message to a delegate.

use std::{
    any::Any,
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    net::TcpStream,
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelId, PEER_CHANNEL},
    config::GossipConfig,
    error::NodeError,
    ids::ContentId,
    transport::{BoxedStream, SecureReader, SecureWriter, secure_handshake},
    wire::{ConfigMsg, ErrorReportMsg, Message, PeerPayload},
};

const ERROR_REPORT_TIMEOUT: Duration = Duration::from_secs(1);
pub const ERROR_CODE_PROTOCOL: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Remote closed the stream.
    Closed,
    /// Local `close()`.
    Cancelled,
    ProtocolViolation(String),
    Io(String),
}

#[async_trait]
pub trait ConnectionDelegate: Send + Sync {
    /// Called in wire order from the connection's read loop. Returning a
    /// protocol violation tears the connection down.
    async fn on_message(&self, connection: &Arc<Connection>, message: Message)
    -> anyhow::Result<()>;

    /// Called exactly once, from the read loop, after it has stopped.
    async fn on_disconnected(&self, connection: &Arc<Connection>, reason: DisconnectReason);
}

pub struct Connection {
    remote_endpoint: SocketAddr,
    remote_config: ConfigMsg,
    outbound: bool,
    writer: Mutex<Option<SecureWriter>>,
    reader: Mutex<Option<SecureReader>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    known: Mutex<HashMap<ContentId, Instant>>,
    channel_state: Mutex<HashMap<ChannelId, Arc<dyn Any + Send + Sync>>>,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_endpoint", &self.remote_endpoint)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial `addr`, then run the transport and configuration handshakes.
    pub async fn connect(
        addr: SocketAddr,
        local: &ConfigMsg,
        config: &GossipConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.handshake_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {addr} timed out"))?
            .with_context(|| format!("connect to {addr}"))?;
        stream.set_nodelay(true)?;
        Self::handshake(Box::new(stream), addr, true, local, config).await
    }

    pub async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        local: &ConfigMsg,
        config: &GossipConfig,
    ) -> anyhow::Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        Self::handshake(Box::new(stream), addr, false, local, config).await
    }

    /// Exchange configuration over an arbitrary stream. Both sides send their
    /// config first; the first frame received must be the remote config on
    /// the peer channel.
    pub async fn handshake(
        io: BoxedStream,
        remote_endpoint: SocketAddr,
        outbound: bool,
        local: &ConfigMsg,
        config: &GossipConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let exchange = async {
            let (mut reader, mut writer) =
                secure_handshake(io, outbound, config.max_frame_bytes).await?;
            writer
                .send(&Message::from_typed(PEER_CHANNEL, local)?)
                .await?;
            let first = reader.read_message().await?;
            if first.channel != PEER_CHANNEL {
                anyhow::bail!(NodeError::violation(format!(
                    "handshake arrived on channel {} instead of {PEER_CHANNEL}",
                    first.channel
                )));
            }
            let PeerPayload::Config(remote) = PeerPayload::decode(&first)? else {
                anyhow::bail!(NodeError::violation("first peer message was not a config"));
            };
            if remote.chain != local.chain {
                anyhow::bail!(NodeError::violation(format!(
                    "remote chain '{}' does not match local chain '{}'",
                    remote.chain, local.chain
                )));
            }
            Ok((reader, writer, remote))
        };
        let (reader, writer, remote_config) =
            tokio::time::timeout(config.handshake_timeout(), exchange)
                .await
                .map_err(|_| anyhow::anyhow!("handshake with {remote_endpoint} timed out"))??;
        debug!(
            peer = %remote_endpoint,
            outbound,
            channels = remote_config.subscribed_channels.len(),
            "handshake complete"
        );
        Ok(Arc::new(Self {
            remote_endpoint,
            remote_config,
            outbound,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            read_task: Mutex::new(None),
            shutdown: Notify::new(),
            known: Mutex::new(HashMap::new()),
            channel_state: Mutex::new(HashMap::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
        }))
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    pub fn remote_config(&self) -> &ConfigMsg {
        &self.remote_config
    }

    /// Where the remote accepts connections: its advertised contact if any.
    pub fn server_endpoint(&self) -> SocketAddr {
        self.remote_config
            .public_contact
            .unwrap_or(self.remote_endpoint)
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_subscribed(&self, channel: ChannelId) -> bool {
        self.remote_config.subscribed_channels.contains(&channel)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    /// Spawn the read loop. Fails if it was already started.
    pub async fn start(self: &Arc<Self>, delegate: Arc<dyn ConnectionDelegate>) -> anyhow::Result<()> {
        let reader = self
            .reader
            .lock()
            .await
            .take()
            .context("connection read loop already started")?;
        let con = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let reason = con.read_loop(reader, delegate.as_ref()).await;
            if let Some(mut writer) = con.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
            info!(peer = %con.remote_endpoint, ?reason, "connection closed");
            delegate.on_disconnected(&con, reason).await;
        });
        *self.read_task.lock().await = Some(handle);
        Ok(())
    }

    async fn read_loop(
        self: &Arc<Self>,
        mut reader: SecureReader,
        delegate: &dyn ConnectionDelegate,
    ) -> DisconnectReason {
        loop {
            let read = tokio::select! {
                _ = self.shutdown.notified() => return DisconnectReason::Cancelled,
                read = reader.read_message() => read,
            };
            let message = match read {
                Ok(message) => message,
                Err(err) => return self.classify_failure(err).await,
            };
            self.bytes_recv
                .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
            if let Err(err) = delegate.on_message(self, message).await {
                if NodeError::is_protocol_violation(&err) {
                    return self.classify_failure(err).await;
                }
                debug!(peer = %self.remote_endpoint, error = %err, "message handler failed");
            }
        }
    }

    async fn classify_failure(&self, err: anyhow::Error) -> DisconnectReason {
        if let Some(NodeError::ProtocolViolation(reason)) = NodeError::find(&err) {
            warn!(peer = %self.remote_endpoint, %reason, "protocol violation");
            let report = ErrorReportMsg {
                code: ERROR_CODE_PROTOCOL,
                message: reason.clone(),
            };
            if let Ok(message) = Message::from_typed(PEER_CHANNEL, &report) {
                let _ = tokio::time::timeout(ERROR_REPORT_TIMEOUT, self.send(&message)).await;
            }
            return DisconnectReason::ProtocolViolation(reason.clone());
        }
        match err.downcast_ref::<std::io::Error>().map(std::io::Error::kind) {
            Some(
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe,
            ) => DisconnectReason::Closed,
            _ => DisconnectReason::Io(err.to_string()),
        }
    }

    /// Encode and send one message. Concurrent callers are serialized.
    pub async fn send(&self, message: &Message) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            anyhow::bail!(NodeError::ConnectionClosed);
        };
        let frame = message.encode_frame(writer.max_frame_bytes())?;
        writer.write_frame(&frame).await?;
        self.bytes_sent
            .fetch_add(message.payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send a frame produced by [`Message::encode_frame`]; used to fan out
    /// one encoding to many connections.
    pub async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            anyhow::bail!(NodeError::ConnectionClosed);
        };
        writer.write_frame(frame).await?;
        self.bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the read loop and wait for it, then drop the write half.
    ///
    /// Must not be called from inside a delegate callback of this connection.
    pub async fn close(&self) {
        self.shutdown.notify_one();
        let handle = self.read_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }

    // ── known digests ───────────────────────────────────────────────────

    pub async fn set_knows(&self, id: ContentId) {
        self.known.lock().await.insert(id, Instant::now());
    }

    pub async fn knows(&self, id: &ContentId) -> bool {
        self.known.lock().await.contains_key(id)
    }

    pub async fn clear_knows(&self, id: &ContentId) {
        self.known.lock().await.remove(id);
    }

    /// Forget digests recorded longer than `max_age` ago.
    pub async fn prune_known(&self, max_age: Duration) -> usize {
        let mut known = self.known.lock().await;
        let before = known.len();
        known.retain(|_, seen| seen.elapsed() <= max_age);
        before - known.len()
    }

    // ── per-channel state ───────────────────────────────────────────────

    /// Per-channel auxiliary state, created on first use. Only channels the
    /// remote subscribed to get a slot.
    pub async fn channel_state<T>(&self, channel: ChannelId) -> anyhow::Result<Arc<T>>
    where
        T: Any + Send + Sync + Default,
    {
        if !self.is_subscribed(channel) {
            anyhow::bail!(NodeError::NotSubscribed(channel));
        }
        let slot = {
            let mut states = self.channel_state.lock().await;
            Arc::clone(
                states
                    .entry(channel)
                    .or_insert_with(|| Arc::new(T::default())),
            )
        };
        slot.downcast::<T>()
            .map_err(|_| anyhow::anyhow!("channel {channel} state holds a different type"))
    }
}
