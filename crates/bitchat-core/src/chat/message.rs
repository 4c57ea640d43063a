// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Receiver-anonymous chat envelopes.
//!
//! A [`ChatMessage`] names neither sender nor recipient. The sender's key and
//! signature travel inside the ciphertext, which is sealed to the
//! recipient's X25519 key (the Montgomery form of its Ed25519 key) with a
//! fresh ephemeral key per message.

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::{
    ids::ContentId,
    pow,
    wire::{from_cbor, to_cbor},
};

const KEY_CONTEXT: &str = "bitchat chat message key v1";
const NONCE_CONTEXT: &str = "bitchat chat message nonce v1";
const CHECK_CONTEXT: &str = "bitchat chat dh check v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub nonce: u16,
    pub timestamp_ms: u64,
    pub dh_key: [u8; 32],
    /// Lets non-recipients reject without running the AEAD.
    pub dh_check: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedContent {
    pub reply_channel: u32,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    pub timestamp_ms: u64,
    pub from: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub from_sig: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a>(u32, #[serde(with = "serde_bytes")] &'a [u8], u64);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatBodyType {
    Text = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBody {
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ChatBody {
    pub fn text(text: &str) -> Self {
        Self {
            kind: ChatBodyType::Text as u32,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// The UTF-8 text, if this is a text body.
    pub fn as_text(&self) -> Option<anyhow::Result<String>> {
        (self.kind == ChatBodyType::Text as u32)
            .then(|| Ok(String::from_utf8(self.payload.clone())?))
    }
}

impl SignedContent {
    pub fn sign(
        key: &SigningKey,
        reply_channel: u32,
        body: Vec<u8>,
        timestamp_ms: u64,
    ) -> anyhow::Result<Self> {
        let signature = key.sign(&to_cbor(&SignedFields(reply_channel, &body, timestamp_ms))?);
        Ok(Self {
            reply_channel,
            body,
            timestamp_ms,
            from: key.verifying_key().to_bytes(),
            from_sig: signature.to_bytes().to_vec(),
        })
    }

    pub fn verify(&self) -> anyhow::Result<VerifyingKey> {
        let sig: [u8; 64] = self
            .from_sig
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("signature must be 64 bytes"))?;
        let key = VerifyingKey::from_bytes(&self.from)?;
        key.verify(
            &to_cbor(&SignedFields(self.reply_channel, &self.body, self.timestamp_ms))?,
            &Signature::from_bytes(&sig),
        )?;
        Ok(key)
    }
}

/// X25519 secret matching an Ed25519 signing key.
pub fn x25519_secret(key: &SigningKey) -> StaticSecret {
    StaticSecret::from(key.to_scalar_bytes())
}

/// X25519 public key matching an Ed25519 verifying key.
pub fn x25519_public(key: &VerifyingKey) -> X25519PublicKey {
    X25519PublicKey::from(key.to_montgomery().to_bytes())
}

struct MessageKeys {
    key: [u8; 32],
    nonce: [u8; 12],
    check: u32,
}

fn derive_keys(shared: &[u8; 32], dh_key: &[u8; 32]) -> MessageKeys {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(shared);
    ikm[32..].copy_from_slice(dh_key);
    let nonce_material = blake3::derive_key(NONCE_CONTEXT, &ikm);
    let check_material = blake3::derive_key(CHECK_CONTEXT, &ikm);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&nonce_material[..12]);
    MessageKeys {
        key: blake3::derive_key(KEY_CONTEXT, &ikm),
        nonce,
        check: u32::from_le_bytes([
            check_material[0],
            check_material[1],
            check_material[2],
            check_material[3],
        ]),
    }
}

/// Seal `content` so only the holder of `recipient`'s signing key can read it.
pub fn encrypt(
    content: &SignedContent,
    recipient: &VerifyingKey,
    timestamp_ms: u64,
) -> anyhow::Result<ChatMessage> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let dh_key = X25519PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&x25519_public(recipient));
    let keys = derive_keys(shared.as_bytes(), &dh_key);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.key));
    let data = cipher
        .encrypt(Nonce::from_slice(&keys.nonce), to_cbor(content)?.as_slice())
        .map_err(|_| anyhow::anyhow!("failed to seal chat message"))?;
    Ok(ChatMessage {
        nonce: 0,
        timestamp_ms,
        dh_key,
        dh_check: keys.check,
        data,
    })
}

/// Try to open `message` with `identity`'s key. `Ok(None)` means the message
/// is addressed to someone else.
pub fn decrypt(message: &ChatMessage, identity: &SigningKey) -> anyhow::Result<Option<SignedContent>> {
    let shared = x25519_secret(identity).diffie_hellman(&X25519PublicKey::from(message.dh_key));
    let keys = derive_keys(shared.as_bytes(), &message.dh_key);
    if keys.check != message.dh_check {
        return Ok(None);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.key));
    let Ok(plain) = cipher.decrypt(Nonce::from_slice(&keys.nonce), message.data.as_slice()) else {
        return Ok(None);
    };
    let content: SignedContent = from_cbor(&plain)?;
    content.verify()?;
    Ok(Some(content))
}

impl ChatMessage {
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        to_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_cbor(bytes)
    }

    /// Search nonce (and, once the nonce wraps, timestamp) values until the
    /// encoded message meets `target_bits_per_kb`. Returns the encoding.
    pub fn do_proof_of_work(&mut self, target_bits_per_kb: u32) -> anyhow::Result<Vec<u8>> {
        let probe = self.to_bytes()?;
        let required = pow::required_bits(target_bits_per_kb, probe.len());
        if required > pow::MAX_MINEABLE_BITS {
            anyhow::bail!(
                "proof-of-work target of {required} bits exceeds the {} bit search limit",
                pow::MAX_MINEABLE_BITS
            );
        }
        loop {
            for nonce in 0..=u16::MAX {
                self.nonce = nonce;
                let bytes = self.to_bytes()?;
                let id = ContentId::from_bytes(&bytes);
                if pow::meets_target(&id, target_bits_per_kb, bytes.len()) {
                    return Ok(bytes);
                }
            }
            self.timestamp_ms = self.timestamp_ms.wrapping_add(1);
        }
    }
}

/// Base58 address of a public key.
pub fn to_address(key: &VerifyingKey) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

pub fn from_address(address: &str) -> anyhow::Result<VerifyingKey> {
    let raw = bs58::decode(address.trim())
        .into_vec()
        .map_err(|e| anyhow::anyhow!("invalid address '{address}': {e}"))?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("address must decode to 32 bytes, got {}", raw.len()))?;
    Ok(VerifyingKey::from_bytes(&bytes)?)
}
