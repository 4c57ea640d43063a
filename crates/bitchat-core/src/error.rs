// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Typed failures callers are expected to match on.
//!
//! Everything else travels as a plain `anyhow::Error`; these variants are
//! wrapped into `anyhow` as well and recovered with [`NodeError::find`].

use crate::channel::ChannelId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("handler for channel {0} is no longer alive")]
    HandlerDefunct(ChannelId),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("remote peer is not subscribed to channel {0}")]
    NotSubscribed(ChannelId),
}

impl NodeError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    /// Look for a `NodeError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&NodeError> {
        err.chain().find_map(|cause| cause.downcast_ref::<NodeError>())
    }

    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Self::NotFound { .. }))
    }

    pub fn is_protocol_violation(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Self::ProtocolViolation(_)))
    }
}
