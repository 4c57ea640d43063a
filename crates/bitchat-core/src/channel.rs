// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Null / padding.
    Null = 0,
    /// Discovery and connection configuration.
    Peer = 1,
    /// Encrypted chat messages.
    Chat = 2,
    /// Mail messages.
    Mail = 3,
}

impl Protocol {
    pub const ALL: [Self; 4] = [Self::Null, Self::Peer, Self::Chat, Self::Mail];

    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Peer => "peer",
            Self::Chat => "chat",
            Self::Mail => "mail",
        }
    }
}

impl From<Protocol> for u32 {
    fn from(value: Protocol) -> Self {
        value as u32
    }
}

impl TryFrom<u32> for Protocol {
    type Error = NodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Peer),
            2 => Ok(Self::Chat),
            3 => Ok(Self::Mail),
            _ => Err(NodeError::violation(format!("unknown channel protocol {value}"))),
        }
    }
}

/// Logical pub/sub topic multiplexed over a connection.
///
/// Identity is the canonical 64-bit key `protocol << 32 | number`; equality,
/// ordering and hashing all go through [`ChannelId::key`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelId {
    pub protocol: Protocol,
    pub number: u32,
}

pub const PEER_CHANNEL: ChannelId = ChannelId::new(Protocol::Peer, 0);
pub const CHAT_CHANNEL: ChannelId = ChannelId::new(Protocol::Chat, 0);

impl ChannelId {
    pub const fn new(protocol: Protocol, number: u32) -> Self {
        Self { protocol, number }
    }

    pub const fn key(&self) -> u64 {
        ((self.protocol as u64) << 32) | self.number as u64
    }

    pub fn from_key(key: u64) -> Result<Self, NodeError> {
        let protocol = Protocol::try_from((key >> 32) as u32)?;
        Ok(Self::new(protocol, key as u32))
    }
}

impl PartialEq for ChannelId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ChannelId {}

impl PartialOrd for ChannelId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for ChannelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol.name(), self.number)
    }
}
