// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use ed25519_dalek::SigningKey;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::chat::{Contact, Identity, message::from_address, message::to_address};

const KEY_KDF_ITERATIONS: u32 = 120_000;
pub const IDENTITIES_FILE: &str = "idents.json";
pub const CONTACTS_FILE: &str = "contacts.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub identities: Vec<PersistedIdentity>,
    pub contacts: Vec<PersistedContact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIdentity {
    pub label: String,
    pub key: StoredSecret,
    pub broadcast: StoredSecret,
    #[serde(default)]
    pub recv_channels: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedContact {
    pub label: String,
    /// Base58 address.
    pub key: String,
    /// Hex X25519 public key.
    pub recv_broadcast: String,
    #[serde(default)]
    pub send_channels: Vec<u32>,
}

/// A 32-byte secret, either hex encoded or sealed under a passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredSecret {
    Hex(String),
    Sealed(EncryptedSecret),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub salt: [u8; 16],
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

impl StoredSecret {
    pub fn seal(secret: &[u8; 32], passphrase: Option<&str>) -> anyhow::Result<Self> {
        Ok(match passphrase {
            Some(passphrase) => Self::Sealed(encrypt_secret(secret, passphrase)?),
            None => Self::Hex(hex::encode(secret)),
        })
    }

    pub fn open(&self, passphrase: Option<&str>) -> anyhow::Result<[u8; 32]> {
        let raw = match self {
            Self::Hex(encoded) => hex::decode(encoded)?,
            Self::Sealed(sealed) => {
                let passphrase =
                    passphrase.context("secret is sealed; a passphrase is required")?;
                decrypt_secret(sealed, passphrase)?
            }
        };
        raw.as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("secret must be 32 bytes, got {}", raw.len()))
    }
}

impl PersistedIdentity {
    pub fn from_identity(identity: &Identity, passphrase: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            label: identity.label.clone(),
            key: StoredSecret::seal(&identity.key.to_bytes(), passphrase)?,
            broadcast: StoredSecret::seal(&identity.broadcast, passphrase)?,
            recv_channels: identity.recv_channels.clone(),
        })
    }

    pub fn to_identity(&self, passphrase: Option<&str>) -> anyhow::Result<Identity> {
        Ok(Identity {
            label: self.label.clone(),
            key: SigningKey::from_bytes(&self.key.open(passphrase)?),
            broadcast: self.broadcast.open(passphrase)?,
            recv_channels: self.recv_channels.clone(),
        })
    }
}

impl PersistedContact {
    pub fn from_contact(contact: &Contact) -> Self {
        Self {
            label: contact.label.clone(),
            key: to_address(&contact.key),
            recv_broadcast: hex::encode(contact.recv_broadcast),
            send_channels: contact.send_channels.clone(),
        }
    }

    pub fn to_contact(&self) -> anyhow::Result<Contact> {
        let recv_broadcast = hex::decode(&self.recv_broadcast)?;
        Ok(Contact {
            label: self.label.clone(),
            key: from_address(&self.key)?,
            recv_broadcast: recv_broadcast
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("contact '{}' has a malformed broadcast key", self.label))?,
            send_channels: self.send_channels.clone(),
        })
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_state(&self) -> anyhow::Result<PersistedState>;
    async fn save_state(&self, state: &PersistedState) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<PersistedState>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_state(&self) -> anyhow::Result<PersistedState> {
        Ok(self.state.read().await.clone())
    }

    async fn save_state(&self, state: &PersistedState) -> anyhow::Result<()> {
        *self.state.write().await = state.clone();
        Ok(())
    }
}

/// Identities and contacts as two JSON files in a data directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
        Ok(Arc::new(Self { dir }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn read_list<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Replace `path` through a temporary sibling so readers never see a partial file.
fn write_list<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(items)?)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl Store for JsonFileStore {
    async fn load_state(&self) -> anyhow::Result<PersistedState> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            Ok(PersistedState {
                identities: read_list(&dir.join(IDENTITIES_FILE))?,
                contacts: read_list(&dir.join(CONTACTS_FILE))?,
            })
        })
        .await?
    }

    async fn save_state(&self, state: &PersistedState) -> anyhow::Result<()> {
        let dir = self.dir.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || {
            write_list(&dir.join(IDENTITIES_FILE), &state.identities)?;
            write_list(&dir.join(CONTACTS_FILE), &state.contacts)
        })
        .await?
    }
}

pub fn encrypt_secret(secret: &[u8], passphrase: &str) -> anyhow::Result<EncryptedSecret> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 24];
    let mut rng = rand::rngs::OsRng;
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let mut key_bytes = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(
        passphrase.as_bytes(),
        &salt,
        KEY_KDF_ITERATIONS,
        &mut key_bytes,
    );
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), secret)
        .map_err(|_| anyhow::anyhow!("failed to encrypt secret"))?;

    Ok(EncryptedSecret {
        salt,
        nonce,
        ciphertext,
    })
}

pub fn decrypt_secret(secret: &EncryptedSecret, passphrase: &str) -> anyhow::Result<Vec<u8>> {
    let mut key_bytes = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(
        passphrase.as_bytes(),
        &secret.salt,
        KEY_KDF_ITERATIONS,
        &mut key_bytes,
    );
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    cipher
        .decrypt(XNonce::from_slice(&secret.nonce), secret.ciphertext.as_ref())
        .map_err(|_| anyhow::anyhow!("failed to decrypt secret; wrong passphrase?"))
}
