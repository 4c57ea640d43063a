// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Encrypted byte stream that frames travel over.
//!
//! Each side sends a hello carrying an ephemeral X25519 key and a random
//! nonce. Both derive one ChaCha20-Poly1305 key per direction from the
//! shared secret; every write is then sealed as a single length-prefixed
//! record. The reader buffers plaintext, so frames may span records.

use anyhow::Context;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::{
    error::NodeError,
    wire::{Message, check_frame_len},
};

pub const HELLO_MAX_BYTES: usize = 64 * 1024;
pub const TRANSPORT_VERSION: u16 = 1;
const AEAD_TAG_BYTES: usize = 16;

pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncIo>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransportHello {
    version: u16,
    ephemeral_pubkey: [u8; 32],
    nonce: [u8; 32],
}

pub fn generate_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Exchange hellos and split `io` into sealed read and write halves.
///
/// `initiator` only decides which derived key protects which direction;
/// the exchange itself is symmetric.
pub async fn secure_handshake(
    io: BoxedStream,
    initiator: bool,
    max_frame_bytes: usize,
) -> anyhow::Result<(SecureReader, SecureWriter)> {
    let mut io = io;
    let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let local = TransportHello {
        version: TRANSPORT_VERSION,
        ephemeral_pubkey: X25519PublicKey::from(&secret).to_bytes(),
        nonce: generate_nonce(),
    };
    write_hello(&mut io, &local).await?;
    let remote = read_hello(&mut io).await?;
    if remote.version != TRANSPORT_VERSION {
        anyhow::bail!(NodeError::violation(format!(
            "incompatible transport version: local={TRANSPORT_VERSION}, remote={}",
            remote.version
        )));
    }
    if remote.nonce == local.nonce {
        anyhow::bail!(NodeError::violation("transport hello reflected back"));
    }

    let shared = secret.diffie_hellman(&X25519PublicKey::from(remote.ephemeral_pubkey));
    let (initiator_nonce, responder_nonce) = if initiator {
        (&local.nonce, &remote.nonce)
    } else {
        (&remote.nonce, &local.nonce)
    };
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(shared.as_bytes());
    ikm.extend_from_slice(initiator_nonce);
    ikm.extend_from_slice(responder_nonce);
    let to_responder = blake3::derive_key("bitchat transport initiator-to-responder v1", &ikm);
    let to_initiator = blake3::derive_key("bitchat transport responder-to-initiator v1", &ikm);
    let (send_key, recv_key) = if initiator {
        (to_responder, to_initiator)
    } else {
        (to_initiator, to_responder)
    };

    let (read_half, write_half) = tokio::io::split(io);
    // A record carries at most one frame plus its length prefix.
    let max_record = max_frame_bytes + 8 + AEAD_TAG_BYTES;
    Ok((
        SecureReader {
            io: read_half,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&recv_key)),
            counter: 0,
            buffer: Vec::new(),
            max_record,
            max_frame_bytes,
        },
        SecureWriter {
            io: write_half,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&send_key)),
            counter: 0,
            max_record,
            max_frame_bytes,
        },
    ))
}

async fn write_hello<S>(io: &mut S, hello: &TransportHello) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = crate::wire::to_cbor(hello)?;
    if bytes.len() > HELLO_MAX_BYTES {
        anyhow::bail!("transport hello exceeds max size");
    }
    io.write_u32(bytes.len() as u32).await?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

async fn read_hello<S>(io: &mut S) -> anyhow::Result<TransportHello>
where
    S: AsyncRead + Unpin,
{
    let len = io.read_u32().await? as usize;
    if len > HELLO_MAX_BYTES {
        anyhow::bail!(NodeError::violation("transport hello exceeds max size"));
    }
    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;
    crate::wire::from_cbor(&data)
}

fn record_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    *Nonce::from_slice(&nonce)
}

pub struct SecureWriter {
    io: WriteHalf<BoxedStream>,
    cipher: ChaCha20Poly1305,
    counter: u64,
    max_record: usize,
    max_frame_bytes: usize,
}

impl SecureWriter {
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Seal and write one already-encoded frame.
    pub async fn write_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        let nonce = record_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .context("transport record counter exhausted")?;
        let sealed = self
            .cipher
            .encrypt(&nonce, frame)
            .map_err(|_| anyhow::anyhow!("failed to seal transport record"))?;
        if sealed.len() > self.max_record {
            anyhow::bail!("transport record exceeds max size");
        }
        self.io.write_u32(sealed.len() as u32).await?;
        self.io.write_all(&sealed).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        let frame = message.encode_frame(self.max_frame_bytes)?;
        self.write_frame(&frame).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

pub struct SecureReader {
    io: ReadHalf<BoxedStream>,
    cipher: ChaCha20Poly1305,
    counter: u64,
    buffer: Vec<u8>,
    max_record: usize,
    max_frame_bytes: usize,
}

impl SecureReader {
    async fn fill(&mut self) -> anyhow::Result<()> {
        let len = self.io.read_u32().await? as usize;
        if len > self.max_record {
            anyhow::bail!(NodeError::violation(format!(
                "transport record of {len} bytes exceeds max size"
            )));
        }
        let mut sealed = vec![0u8; len];
        self.io.read_exact(&mut sealed).await?;
        let nonce = record_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .context("transport record counter exhausted")?;
        let plain = self
            .cipher
            .decrypt(&nonce, sealed.as_slice())
            .map_err(|_| NodeError::violation("transport record failed authentication"))?;
        self.buffer.extend_from_slice(&plain);
        Ok(())
    }

    async fn take(&mut self, n: usize) -> anyhow::Result<Vec<u8>> {
        while self.buffer.len() < n {
            self.fill().await?;
        }
        let rest = self.buffer.split_off(n);
        Ok(std::mem::replace(&mut self.buffer, rest))
    }

    /// Read the next frame and decode its header.
    pub async fn read_message(&mut self) -> anyhow::Result<Message> {
        let mut len = [0u8; 8];
        len.copy_from_slice(&self.take(8).await?);
        let len = check_frame_len(u64::from_le_bytes(len), self.max_frame_bytes)?;
        let body = self.take(len).await?;
        Message::decode_frame_body(&body)
    }
}
