// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::{channel::ChannelId, connection::Connection, error::NodeError, wire::Message};

#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_message(&self, connection: &Arc<Connection>, message: Message)
    -> anyhow::Result<()>;
}

/// Routes messages to per-channel handlers.
///
/// The registry only holds weak references; the subsystem that owns a
/// handler keeps it alive. Dispatching to a handler that has since been
/// dropped is reported as [`NodeError::HandlerDefunct`].
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: RwLock<HashMap<ChannelId, Weak<dyn ChannelHandler>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, channel: ChannelId, handler: &Arc<dyn ChannelHandler>) {
        self.handlers
            .write()
            .await
            .insert(channel, Arc::downgrade(handler));
    }

    pub async fn unsubscribe(&self, channel: ChannelId) -> bool {
        self.handlers.write().await.remove(&channel).is_some()
    }

    pub async fn channels(&self) -> BTreeSet<ChannelId> {
        self.handlers.read().await.keys().copied().collect()
    }

    pub async fn is_subscribed(&self, channel: ChannelId) -> bool {
        self.handlers.read().await.contains_key(&channel)
    }

    pub async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        message: Message,
    ) -> anyhow::Result<()> {
        let channel = message.channel;
        let Some(handler) = self.handlers.read().await.get(&channel).cloned() else {
            debug!(
                peer = %connection.remote_endpoint(),
                %channel,
                "dropping message for unsubscribed channel"
            );
            return Ok(());
        };
        let Some(handler) = handler.upgrade() else {
            error!(%channel, "dispatch to defunct channel handler");
            anyhow::bail!(NodeError::HandlerDefunct(channel));
        };
        handler.on_message(connection, message).await
    }
}
