// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
pub mod channel;
pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod gossip;
pub mod ids;
pub mod inventory;
pub mod peer_db;
pub mod pow;
pub mod registry;
pub mod server;
pub mod store;
pub mod transport;
pub mod wire;

pub use channel::{CHAT_CHANNEL, ChannelId, PEER_CHANNEL, Protocol};
pub use chat::{
    Chat, ChatDelegate, ChatOptions, Contact, ContactStatus, Identity, from_address, to_address,
};
pub use config::{GossipConfig, NodeConfig};
pub use connection::{Connection, ConnectionDelegate, DisconnectReason};
pub use error::NodeError;
pub use gossip::{ContentSink, GossipEngine, PendingFetch};
pub use ids::ContentId;
pub use inventory::InventoryStore;
pub use peer_db::{MemoryPeerDb, PeerDb, PeerRecord, SqlitePeerDb};
pub use registry::{ChannelHandler, ChannelRegistry};
pub use server::Server;
pub use store::{JsonFileStore, MemoryStore, PersistedState, Store};
pub use transport::{AsyncIo, BoxedStream, secure_handshake};
pub use wire::{ConfigMsg, Message};
