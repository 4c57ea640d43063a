// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Encrypted messaging on top of the chat channel's inventory.

pub mod message;

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::{
    channel::{CHAT_CHANNEL, ChannelId},
    error::NodeError,
    gossip::{ContentSink, GossipEngine},
    ids::ContentId,
    store::{PersistedContact, PersistedIdentity, PersistedState, Store},
    wire::{from_cbor, to_cbor},
};

pub use message::{ChatBody, ChatBodyType, ChatMessage, SignedContent, from_address, to_address};

/// A local principal that can sign and receive.
#[derive(Clone)]
pub struct Identity {
    pub label: String,
    pub key: SigningKey,
    /// Secret half of the broadcast key.
    pub broadcast: [u8; 32],
    pub recv_channels: Vec<u32>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("label", &self.label)
            .field("address", &self.address())
            .field("recv_channels", &self.recv_channels)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate(label: impl Into<String>) -> Self {
        Self::generate_with(label, &mut rand::rngs::OsRng)
    }

    pub fn generate_with<R: RngCore + CryptoRng>(label: impl Into<String>, rng: &mut R) -> Self {
        let key = SigningKey::generate(rng);
        let mut broadcast = [0u8; 32];
        rng.fill_bytes(&mut broadcast);
        Self {
            label: label.into(),
            key,
            broadcast,
            recv_channels: vec![CHAT_CHANNEL.number],
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn address(&self) -> String {
        to_address(&self.public_key())
    }

    pub fn broadcast_public(&self) -> [u8; 32] {
        X25519PublicKey::from(&StaticSecret::from(self.broadcast)).to_bytes()
    }

    /// What others need to address this identity.
    pub fn to_contact(&self, label: impl Into<String>) -> Contact {
        Contact {
            label: label.into(),
            key: self.public_key(),
            recv_broadcast: self.broadcast_public(),
            send_channels: self.recv_channels.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub label: String,
    pub key: VerifyingKey,
    pub recv_broadcast: [u8; 32],
    pub send_channels: Vec<u32>,
}

impl Contact {
    pub fn new(label: impl Into<String>, key: VerifyingKey) -> Self {
        Self {
            label: label.into(),
            key,
            recv_broadcast: [0u8; 32],
            send_channels: vec![CHAT_CHANNEL.number],
        }
    }

    pub fn address(&self) -> String {
        to_address(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactStatus {
    pub contact: Contact,
    pub away_message: String,
    pub online: bool,
}

pub trait ChatDelegate: Send + Sync {
    fn received_message(&self, text: &str, to: &Identity, from: &ContactStatus);
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub pow_target_bits_per_kb: u32,
    /// Seals identity secrets at rest when set.
    pub passphrase: Option<String>,
}

pub struct Chat {
    engine: Arc<GossipEngine>,
    store: Arc<dyn Store>,
    options: ChatOptions,
    channel: ChannelId,
    identities: RwLock<BTreeMap<String, Identity>>,
    contacts: RwLock<BTreeMap<String, Contact>>,
    delegate: RwLock<Option<Arc<dyn ChatDelegate>>>,
    /// Held across insert and save so snapshots reach the store in order.
    writes: Mutex<()>,
}

/// Forwards fetched content to the chat without the engine owning it.
struct ChatSink(Weak<Chat>);

#[async_trait]
impl ContentSink for ChatSink {
    async fn on_content(&self, channel: ChannelId, id: ContentId, content: &[u8]) {
        if let Some(chat) = self.0.upgrade()
            && channel == chat.channel
        {
            chat.receive(id, content).await;
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Chat {
    /// Load persisted identities and contacts and start serving the chat
    /// channel on `engine`.
    pub async fn start(
        engine: Arc<GossipEngine>,
        store: Arc<dyn Store>,
        options: ChatOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let persisted = store.load_state().await?;
        let passphrase = options.passphrase.as_deref();
        let mut identities = BTreeMap::new();
        for entry in &persisted.identities {
            let identity = entry.to_identity(passphrase)?;
            identities.insert(identity.label.clone(), identity);
        }
        let mut contacts = BTreeMap::new();
        for entry in &persisted.contacts {
            let contact = entry.to_contact()?;
            contacts.insert(contact.label.clone(), contact);
        }
        debug!(
            identities = identities.len(),
            contacts = contacts.len(),
            "loaded chat state"
        );

        let chat = Arc::new(Self {
            engine: Arc::clone(&engine),
            store,
            options,
            channel: CHAT_CHANNEL,
            identities: RwLock::new(identities),
            contacts: RwLock::new(contacts),
            delegate: RwLock::new(None),
            writes: Mutex::new(()),
        });
        engine.serve_channel(chat.channel).await;
        engine
            .set_sink(Arc::new(ChatSink(Arc::downgrade(&chat))))
            .await;
        Ok(chat)
    }

    pub async fn set_delegate(&self, delegate: Arc<dyn ChatDelegate>) {
        *self.delegate.write().await = Some(delegate);
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let passphrase = self.options.passphrase.as_deref();
        let identities = self
            .identities
            .read()
            .await
            .values()
            .map(|identity| PersistedIdentity::from_identity(identity, passphrase))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let contacts = self
            .contacts
            .read()
            .await
            .values()
            .map(PersistedContact::from_contact)
            .collect();
        self.store
            .save_state(&PersistedState {
                identities,
                contacts,
            })
            .await
    }

    /// Insert and save `identity`. Nothing is kept if the save fails.
    pub async fn add_identity(&self, identity: Identity) -> anyhow::Result<()> {
        let _writes = self.writes.lock().await;
        let label = identity.label.clone();
        let address = identity.address();
        {
            let mut identities = self.identities.write().await;
            if identities.contains_key(&label) {
                anyhow::bail!("identity '{label}' already exists");
            }
            identities.insert(label.clone(), identity);
        }
        if let Err(err) = self.persist().await {
            self.identities.write().await.remove(&label);
            return Err(err);
        }
        info!(%label, %address, "identity added");
        Ok(())
    }

    /// Insert and save `contact`. Nothing is kept if the save fails.
    pub async fn add_contact(&self, contact: Contact) -> anyhow::Result<()> {
        let _writes = self.writes.lock().await;
        let label = contact.label.clone();
        let address = contact.address();
        {
            let mut contacts = self.contacts.write().await;
            if contacts.contains_key(&label) {
                anyhow::bail!("contact '{label}' already exists");
            }
            contacts.insert(label.clone(), contact);
        }
        if let Err(err) = self.persist().await {
            self.contacts.write().await.remove(&label);
            return Err(err);
        }
        info!(%label, %address, "contact added");
        Ok(())
    }

    pub async fn get_identity(&self, label: &str) -> anyhow::Result<Identity> {
        self.identities
            .read()
            .await
            .get(label)
            .cloned()
            .ok_or_else(|| NodeError::not_found("identity", label).into())
    }

    pub async fn get_contact(&self, label: &str) -> anyhow::Result<Contact> {
        self.contacts
            .read()
            .await
            .get(label)
            .cloned()
            .ok_or_else(|| NodeError::not_found("contact", label).into())
    }

    /// All identities in label order.
    pub async fn identities(&self) -> Vec<Identity> {
        self.identities.read().await.values().cloned().collect()
    }

    /// All contacts in label order.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().await.values().cloned().collect()
    }

    /// Sign `text` as `from_identity`, seal it to `to_contact`, stamp it
    /// with proof of work and announce it.
    pub async fn send_message(
        &self,
        text: &str,
        to_contact: &str,
        from_identity: &str,
    ) -> anyhow::Result<ContentId> {
        let from = self.get_identity(from_identity).await?;
        let to = self.get_contact(to_contact).await?;

        let timestamp_ms = now_unix_ms();
        let reply_channel = from
            .recv_channels
            .first()
            .copied()
            .unwrap_or(CHAT_CHANNEL.number);
        let body = to_cbor(&ChatBody::text(text))?;
        let signed = SignedContent::sign(&from.key, reply_channel, body, timestamp_ms)?;
        let mut sealed = message::encrypt(&signed, &to.key, timestamp_ms)?;
        let target = self.options.pow_target_bits_per_kb;
        let bytes = tokio::task::spawn_blocking(move || sealed.do_proof_of_work(target)).await??;

        let id = self.engine.store_inventory(self.channel, bytes).await?;
        self.engine.broadcast_inventory(self.channel).await?;
        info!(%id, from = %from.label, to = %to.label, "message sent");
        Ok(id)
    }

    /// Trial-decrypt `content` against every local identity.
    async fn receive(&self, id: ContentId, content: &[u8]) {
        let sealed = match ChatMessage::from_bytes(content) {
            Ok(sealed) => sealed,
            Err(err) => {
                trace!(%id, error = %err, "content is not a chat message");
                return;
            }
        };
        let identities = self.identities().await;
        for identity in identities {
            match message::decrypt(&sealed, &identity.key) {
                Ok(Some(signed)) => {
                    self.deliver(id, &identity, signed).await;
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%id, to = %identity.label, error = %err, "rejecting chat message");
                    return;
                }
            }
        }
        trace!(%id, "chat message not addressed to a local identity");
    }

    async fn deliver(&self, id: ContentId, to: &Identity, signed: SignedContent) {
        let body: ChatBody = match from_cbor(&signed.body) {
            Ok(body) => body,
            Err(err) => {
                warn!(%id, error = %err, "malformed chat body");
                return;
            }
        };
        let text = match body.as_text() {
            Some(Ok(text)) => text,
            Some(Err(err)) => {
                warn!(%id, error = %err, "chat text is not valid UTF-8");
                return;
            }
            None => {
                debug!(%id, kind = body.kind, "ignoring chat body of unknown type");
                return;
            }
        };
        let Ok(sender) = VerifyingKey::from_bytes(&signed.from) else {
            return;
        };
        let contact = self
            .contacts
            .read()
            .await
            .values()
            .find(|contact| contact.key == sender)
            .cloned()
            .unwrap_or_else(|| Contact::new(to_address(&sender), sender));
        let status = ContactStatus {
            contact,
            away_message: String::new(),
            online: true,
        };
        debug!(%id, to = %to.label, from = %status.contact.label, "message received");
        let delegate = self.delegate.read().await.clone();
        if let Some(delegate) = delegate {
            delegate.received_message(&text, to, &status);
        }
    }
}
