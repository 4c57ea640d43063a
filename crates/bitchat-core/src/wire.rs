// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Frame codec and the typed messages carried inside frames.
//!
//! A frame is `u64 len` (little-endian, a multiple of 8, bounded by the
//! configured maximum) followed by `len` bytes: the 8-byte channel key, a
//! `u32` payload length, the payload and zero padding up to `len`.
//!
//! Payloads start with a `u16` message type followed by the CBOR body of
//! that type. Peer-channel types and gossip types live in separate
//! registries ([`PeerMsgType`], [`GossipMsgType`]) because the same code means
//! different things on different protocols.

use std::{collections::BTreeSet, net::SocketAddr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{channel::ChannelId, error::NodeError, ids::ContentId};

/// Bytes preceding the payload inside a frame body.
pub const FRAME_BODY_HEADER_BYTES: usize = 12;
pub const FRAME_ALIGNMENT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: ChannelId,
    pub payload: Vec<u8>,
}

/// A CBOR body with a fixed type code within its protocol.
pub trait WireBody: Serialize + DeserializeOwned {
    const TYPE: u16;
}

impl Message {
    pub fn new(channel: ChannelId, payload: Vec<u8>) -> Self {
        Self { channel, payload }
    }

    pub fn from_typed<T: WireBody>(channel: ChannelId, body: &T) -> anyhow::Result<Self> {
        let mut payload = T::TYPE.to_le_bytes().to_vec();
        ciborium::into_writer(body, &mut payload)?;
        Ok(Self { channel, payload })
    }

    pub fn msg_type(&self) -> anyhow::Result<u16> {
        let Some(raw) = self.payload.get(..2) else {
            return Err(NodeError::violation("message payload is missing its type").into());
        };
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    /// Decode the body following the type code, ignoring the type itself.
    pub fn body<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let raw = self.payload.get(2..).unwrap_or_default();
        from_cbor(raw)
    }

    /// Serialize into a complete frame, length prefix included.
    pub fn encode_frame(&self, max_frame_bytes: usize) -> anyhow::Result<Vec<u8>> {
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| NodeError::violation("payload too large for a frame"))?;
        let body_len = (FRAME_BODY_HEADER_BYTES + self.payload.len()).next_multiple_of(FRAME_ALIGNMENT);
        if body_len > max_frame_bytes {
            anyhow::bail!(NodeError::violation(format!(
                "frame of {body_len} bytes exceeds maximum of {max_frame_bytes}"
            )));
        }
        let mut frame = Vec::with_capacity(8 + body_len);
        frame.extend_from_slice(&(body_len as u64).to_le_bytes());
        frame.extend_from_slice(&self.channel.key().to_le_bytes());
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        frame.resize(8 + body_len, 0);
        Ok(frame)
    }

    /// Parse a frame body (everything after the length prefix).
    pub fn decode_frame_body(body: &[u8]) -> anyhow::Result<Self> {
        if body.len() < FRAME_BODY_HEADER_BYTES {
            anyhow::bail!(NodeError::violation(format!(
                "frame body of {} bytes is shorter than its header",
                body.len()
            )));
        }
        let mut key = [0u8; 8];
        key.copy_from_slice(&body[..8]);
        let channel = ChannelId::from_key(u64::from_le_bytes(key))?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&body[8..12]);
        let payload_len = u32::from_le_bytes(len) as usize;
        let Some(payload) = body.get(FRAME_BODY_HEADER_BYTES..FRAME_BODY_HEADER_BYTES + payload_len)
        else {
            anyhow::bail!(NodeError::violation(format!(
                "payload length {payload_len} overruns frame of {} bytes",
                body.len()
            )));
        };
        Ok(Self {
            channel,
            payload: payload.to_vec(),
        })
    }
}

/// Validate a frame length prefix read from the wire.
pub fn check_frame_len(len: u64, max_frame_bytes: usize) -> Result<usize, NodeError> {
    if len > max_frame_bytes as u64 {
        return Err(NodeError::violation(format!(
            "frame length {len} exceeds maximum of {max_frame_bytes}"
        )));
    }
    if len % FRAME_ALIGNMENT as u64 != 0 {
        return Err(NodeError::violation(format!(
            "frame length {len} is not a multiple of {FRAME_ALIGNMENT}"
        )));
    }
    if (len as usize) < FRAME_BODY_HEADER_BYTES {
        return Err(NodeError::violation(format!("frame length {len} is too short")));
    }
    Ok(len as usize)
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| NodeError::violation(format!("malformed message body: {e}")).into())
}

// ── Peer protocol ───────────────────────────────────────────────────────

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerMsgType {
    Generic = 0,
    /// Capability / subscription handshake.
    Config = 1,
    /// Peer exchange.
    KnownHosts = 2,
    /// Reason sent before dropping a misbehaving peer.
    ErrorReport = 3,
    /// Reserved for mail delivery.
    Mail = 4,
}

impl TryFrom<u16> for PeerMsgType {
    type Error = NodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Generic),
            1 => Ok(Self::Config),
            2 => Ok(Self::KnownHosts),
            3 => Ok(Self::ErrorReport),
            4 => Ok(Self::Mail),
            _ => Err(NodeError::violation(format!("unknown peer message type {value}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMsg {
    pub supported_features: BTreeSet<String>,
    pub subscribed_channels: BTreeSet<ChannelId>,
    pub public_contact: Option<SocketAddr>,
    pub min_relay_fee: u64,
    #[serde(default)]
    pub chain: String,
}

impl WireBody for ConfigMsg {
    const TYPE: u16 = PeerMsgType::Config as u16;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub endpoint: SocketAddr,
    pub last_com_unix: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHostsMsg {
    pub hosts: Vec<Host>,
}

impl WireBody for KnownHostsMsg {
    const TYPE: u16 = PeerMsgType::KnownHosts as u16;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReportMsg {
    pub code: u32,
    pub message: String,
}

impl WireBody for ErrorReportMsg {
    const TYPE: u16 = PeerMsgType::ErrorReport as u16;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPayload {
    Config(ConfigMsg),
    KnownHosts(KnownHostsMsg),
    ErrorReport(ErrorReportMsg),
}

impl PeerPayload {
    pub fn decode(message: &Message) -> anyhow::Result<Self> {
        Ok(match PeerMsgType::try_from(message.msg_type()?)? {
            PeerMsgType::Config => Self::Config(message.body()?),
            PeerMsgType::KnownHosts => Self::KnownHosts(message.body()?),
            PeerMsgType::ErrorReport => Self::ErrorReport(message.body()?),
            other => anyhow::bail!(NodeError::violation(format!(
                "unsupported peer message type {other:?}"
            ))),
        })
    }
}

// ── Gossip protocol ─────────────────────────────────────────────────────

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GossipMsgType {
    /// Announce digests the sender holds.
    Inventory = 1,
    /// Request the content behind digests.
    GetData = 2,
    /// One content item.
    Data = 3,
}

impl TryFrom<u16> for GossipMsgType {
    type Error = NodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Inventory),
            2 => Ok(Self::GetData),
            3 => Ok(Self::Data),
            _ => Err(NodeError::violation(format!(
                "unknown gossip message type {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMsg {
    pub items: BTreeSet<ContentId>,
}

impl WireBody for InventoryMsg {
    const TYPE: u16 = GossipMsgType::Inventory as u16;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataMsg {
    pub items: BTreeSet<ContentId>,
}

impl WireBody for GetDataMsg {
    const TYPE: u16 = GossipMsgType::GetData as u16;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMsg {
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl WireBody for DataMsg {
    const TYPE: u16 = GossipMsgType::Data as u16;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipPayload {
    Inventory(InventoryMsg),
    GetData(GetDataMsg),
    Data(DataMsg),
}

impl GossipPayload {
    pub fn decode(message: &Message) -> anyhow::Result<Self> {
        Ok(match GossipMsgType::try_from(message.msg_type()?)? {
            GossipMsgType::Inventory => Self::Inventory(message.body()?),
            GossipMsgType::GetData => Self::GetData(message.body()?),
            GossipMsgType::Data => Self::Data(message.body()?),
        })
    }
}
